// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Journal-backed bookmark store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every `log`, `discard` and `purge` appends one framed record (see
// `journal`) to a single file before the in-memory state changes. Reopening replays the file into a
// `BookmarkTracker`; a torn record at the tail is cut off first. `prune`
// rewrites the file so it only holds what is still live.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bookmark::tracker::BookmarkTracker;
use crate::bookmark::{Bookmark, BookmarkStore, EntryHandle};
use crate::error::StoreResult;
use crate::journal::{self, JournalOp, JournalRecord};
use crate::publish::{poisoned, SyncMode};

struct LoggedState {
    tracker: BookmarkTracker,
    file: File,
    records_written: u64,
    last_sync: Instant,
}

impl LoggedState {
    fn append(&mut self, record: &JournalRecord, mode: SyncMode) -> StoreResult<()> {
        self.file.write_all(&record.serialize())?;
        self.records_written += 1;
        match mode {
            SyncMode::Fsync => self.sync()?,
            SyncMode::Periodic(interval) if self.last_sync.elapsed() >= interval => self.sync()?,
            SyncMode::Periodic(_) | SyncMode::Async => {}
        }
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }
}

/// A bookmark store that journals every change to a file.
pub struct LoggedBookmarkStore {
    path: PathBuf,
    sync_mode: SyncMode,
    state: Mutex<LoggedState>,
}

impl LoggedBookmarkStore {
    /// Open (or create) the journal at `path` and rebuild state from it.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => return Err(error.into()),
        };
        let scan = journal::scan(&data);
        let mut tracker = BookmarkTracker::default();
        for record in &scan.records {
            apply(&mut tracker, record);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if scan.valid_len < data.len() as u64 {
            warn!(
                path = %path.display(),
                valid = scan.valid_len,
                total = data.len(),
                "Cutting torn tail off bookmark journal"
            );
            file.set_len(scan.valid_len)?;
        }

        info!(
            path = %path.display(),
            records = scan.records.len(),
            skipped = scan.skipped,
            subscriptions = tracker.names().len(),
            "Opened bookmark journal"
        );
        Ok(Self {
            path,
            sync_mode,
            state: Mutex::new(LoggedState {
                tracker,
                file,
                records_written: scan.records.len() as u64,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in the journal, including ones `prune` would drop.
    pub fn journal_len(&self) -> u64 {
        self.state.lock().map(|state| state.records_written).unwrap_or(0)
    }

    /// Rewrite the journal with only the live state: for each subscription
    /// its discard point and its undischarged entries. The new journal is
    /// written beside the old one and renamed over it.
    pub fn prune(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let mut image = Vec::new();
        let mut count = 0u64;
        for (subscription, log) in state.tracker.iter() {
            if let Some((entry, bookmark)) = log.last_discarded() {
                image.extend(JournalRecord::new(JournalOp::Log, subscription, *entry, bookmark.as_str()).serialize());
                image.extend(JournalRecord::new(JournalOp::Discard, subscription, *entry, bookmark.as_str()).serialize());
                count += 2;
            }
            for (entry, bookmark) in log.live() {
                image.extend(JournalRecord::new(JournalOp::Log, subscription, *entry, bookmark.as_str()).serialize());
                count += 1;
            }
        }

        let temp_path = self.path.with_extension("prune");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(&image)?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        state.file = OpenOptions::new().append(true).open(&self.path)?;
        let before = state.records_written;
        state.records_written = count;
        state.last_sync = Instant::now();
        info!(before, after = count, "Pruned bookmark journal");
        Ok(())
    }
}

fn apply(tracker: &mut BookmarkTracker, record: &JournalRecord) {
    match record.op {
        JournalOp::Log => tracker
            .entry(&record.subscription)
            .restore_log(record.entry, Bookmark::from(record.bookmark.as_str())),
        JournalOp::Discard => tracker
            .entry(&record.subscription)
            .restore_discarded(record.entry, Bookmark::from(record.bookmark.as_str())),
        JournalOp::Purge if record.subscription.is_empty() => tracker.clear(),
        JournalOp::Purge => {
            tracker.remove(&record.subscription);
        }
    }
}

impl BookmarkStore for LoggedBookmarkStore {
    fn log(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<EntryHandle> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let known = state
            .tracker
            .get(subscription)
            .and_then(|log| log.entry_of(bookmark));
        if let Some(entry) = known {
            return Ok(EntryHandle::new(subscription, entry));
        }

        let entry = state.tracker.next_entry(subscription);
        let record = JournalRecord::new(JournalOp::Log, subscription, entry, bookmark.as_str());
        state.append(&record, self.sync_mode)?;
        state.tracker.entry(subscription).log(bookmark);
        Ok(EntryHandle::new(subscription, entry))
    }

    fn discard(&self, handle: &EntryHandle) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let subscription = handle.subscription();
        let Some((entry, bookmark)) = state.tracker.discard_target(subscription, handle.entry()) else {
            return Ok(());
        };
        let record = JournalRecord::new(JournalOp::Discard, subscription, entry, bookmark.as_str());
        state.append(&record, self.sync_mode)?;
        if let Some(log) = state.tracker.get_mut(subscription) {
            log.discard_through(entry);
        }
        debug!(subscription, entry, "Discarded bookmarks");
        Ok(())
    }

    fn discard_bookmark(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        let entry = {
            let state = self.state.lock().map_err(|_| poisoned())?;
            state.tracker.get(subscription).and_then(|log| log.live_entry(bookmark))
        };
        match entry {
            Some(entry) => self.discard(&EntryHandle::new(subscription, entry)),
            None => Ok(()),
        }
    }

    fn get_most_recent(&self, subscription: &str) -> Option<Bookmark> {
        self.state.lock().ok()?.tracker.most_recent(subscription)
    }

    fn is_discarded(&self, subscription: &str, bookmark: &Bookmark) -> bool {
        self.state
            .lock()
            .map(|state| state.tracker.is_discarded(subscription, bookmark))
            .unwrap_or(false)
    }

    fn oldest_unprocessed(&self, subscription: &str) -> Option<Bookmark> {
        self.state.lock().ok()?.tracker.oldest_unprocessed(subscription)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.tracker.names())
            .unwrap_or_default()
    }

    fn purge_subscription(&self, subscription: &str) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.tracker.remove(subscription).is_some() {
            let record = JournalRecord::new(JournalOp::Purge, subscription, 0, "");
            state.append(&record, self.sync_mode)?;
        }
        Ok(())
    }

    fn purge(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.tracker.clear();
        state.file.set_len(0)?;
        state.sync()?;
        state.records_written = 0;
        info!(path = %self.path.display(), "Purged bookmark journal");
        Ok(())
    }

    fn persist(&self) -> StoreResult<()> {
        self.state.lock().map_err(|_| poisoned())?.sync()
    }

    fn name(&self) -> &str {
        "logged"
    }
}

impl std::fmt::Debug for LoggedBookmarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggedBookmarkStore")
            .field("path", &self.path)
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}
