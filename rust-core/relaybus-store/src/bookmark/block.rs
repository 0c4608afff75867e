// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Block-backed and ring bookmark stores
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Each subscription owns one header record holding its discard point, and
// each undischarged bookmark owns one entry record. Discarding rewrites the
// header and frees the entry records it covers straight away, so their
// slots are the first to be reused.
//
// Record payloads (little-endian):
//
// ```text
// [1 byte: kind]   -- 1 = subscription header, 2 = entry
// [4 bytes: subscription_len (u32)] [N bytes: subscription]
// [4 bytes: bookmark_len (u32)]     [M bytes: bookmark]
// ```
//
// The block sequence field carries the entry number (for a header, the
// entry number of the last discarded bookmark, 0 if none).
//
// The ring variant is the same layout over a fixed-capacity region. When
// every slot holds undischarged state, `log` fails with
// `BookmarkStoreFull` instead of overwriting anything.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{BlockAllocator, BlockAllocatorConfig, BlockIndex, Growth};
use crate::bookmark::tracker::BookmarkTracker;
use crate::bookmark::{Bookmark, BookmarkStore, EntryHandle};
use crate::buffer::{BlockBuffer, MemoryBuffer, MmapBuffer};
use crate::error::{StoreError, StoreResult};
use crate::publish::{poisoned, SyncMode};

const KIND_HEADER: u8 = 1;
const KIND_ENTRY: u8 = 2;

/// Configuration for a [`BlockBookmarkStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBookmarkStoreConfig {
    /// Shape of the block region when it is first created. `Growth::Fixed`
    /// turns the store into a ring.
    #[serde(default)]
    pub allocator: BlockAllocatorConfig,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl Default for BlockBookmarkStoreConfig {
    fn default() -> Self {
        Self {
            allocator: BlockAllocatorConfig::default(),
            sync_mode: SyncMode::default(),
        }
    }
}

impl BlockBookmarkStoreConfig {
    /// A fixed-capacity ring of `capacity` slots.
    pub fn ring(capacity: u32) -> Self {
        Self {
            allocator: BlockAllocatorConfig {
                initial_capacity: capacity,
                growth: Growth::Fixed,
                ..BlockAllocatorConfig::default()
            },
            sync_mode: SyncMode::default(),
        }
    }
}

fn encode(kind: u8, subscription: &str, bookmark: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + subscription.len() + bookmark.len());
    out.push(kind);
    out.extend_from_slice(&(subscription.len() as u32).to_le_bytes());
    out.extend_from_slice(subscription.as_bytes());
    out.extend_from_slice(&(bookmark.len() as u32).to_le_bytes());
    out.extend_from_slice(bookmark.as_bytes());
    out
}

fn decode(index: BlockIndex, payload: &[u8]) -> StoreResult<(u8, String, String)> {
    let corrupt = |reason: &str| StoreError::corrupt(index.0, reason.to_string());
    let kind = *payload.first().ok_or_else(|| corrupt("empty bookmark record"))?;
    let mut offset = 1;
    let mut field = || -> StoreResult<String> {
        let len_bytes = payload
            .get(offset..offset + 4)
            .ok_or_else(|| corrupt("bookmark record truncated"))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        offset += 4;
        let bytes = payload
            .get(offset..offset + len)
            .ok_or_else(|| corrupt("bookmark record truncated"))?;
        offset += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("bookmark record is not UTF-8"))
    };
    let subscription = field()?;
    let bookmark = field()?;
    Ok((kind, subscription, bookmark))
}

#[derive(Debug, Default)]
struct Slots {
    header: Option<BlockIndex>,
    entries: BTreeMap<u64, BlockIndex>,
}

struct BlockBookmarkState<B: BlockBuffer> {
    allocator: BlockAllocator<B>,
    tracker: BookmarkTracker,
    slots: HashMap<String, Slots>,
    last_sync: Instant,
}

impl<B: BlockBuffer> BlockBookmarkState<B> {
    fn maybe_sync(&mut self, mode: SyncMode) -> StoreResult<()> {
        let due = match mode {
            SyncMode::Fsync => true,
            SyncMode::Periodic(interval) => self.last_sync.elapsed() >= interval,
            SyncMode::Async => false,
        };
        if due {
            self.allocator.sync()?;
            self.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Allocate and write a record, mapping exhaustion of a ring to
    /// `BookmarkStoreFull`.
    fn put(&mut self, sequence: u64, payload: &[u8]) -> StoreResult<BlockIndex> {
        let index = match self.allocator.allocate(payload.len()) {
            Ok(index) => index,
            Err(StoreError::StoreFull { capacity }) if self.allocator.growth() == Growth::Fixed => {
                return Err(StoreError::BookmarkStoreFull { capacity });
            }
            Err(error) => return Err(error),
        };
        if let Err(error) = self.allocator.write(index, sequence, payload) {
            let _ = self.allocator.free(index);
            return Err(error);
        }
        Ok(index)
    }

    fn write_header(&mut self, subscription: &str, entry: u64, bookmark: &str) -> StoreResult<()> {
        let payload = encode(KIND_HEADER, subscription, bookmark);
        let existing = self.slots.get(subscription).and_then(|slots| slots.header);
        let index = match existing {
            Some(index) => match self.allocator.write(index, entry, &payload) {
                Ok(()) => return Ok(()),
                Err(StoreError::PayloadTooLarge { .. }) => {
                    // Grown bookmark: move the header to a larger chain.
                    let moved = self.put(entry, &payload)?;
                    self.allocator.free(index)?;
                    moved
                }
                Err(error) => return Err(error),
            },
            None => self.put(entry, &payload)?,
        };
        self.slots.entry(subscription.to_string()).or_default().header = Some(index);
        Ok(())
    }

    fn free_entries(&mut self, subscription: &str, through: u64) -> StoreResult<usize> {
        let freed: Vec<BlockIndex> = match self.slots.get_mut(subscription) {
            Some(slots) => {
                let retained = slots.entries.split_off(&(through + 1));
                std::mem::replace(&mut slots.entries, retained).into_values().collect()
            }
            None => return Ok(0),
        };
        for index in &freed {
            self.allocator.free(*index)?;
        }
        Ok(freed.len())
    }

    fn drop_subscription(&mut self, subscription: &str) -> StoreResult<()> {
        if let Some(slots) = self.slots.remove(subscription) {
            for index in slots.entries.values() {
                self.allocator.free(*index)?;
            }
            if let Some(header) = slots.header {
                self.allocator.free(header)?;
            }
        }
        self.tracker.remove(subscription);
        Ok(())
    }
}

/// A bookmark store over a [`BlockAllocator`], or a fixed-capacity ring
/// when the allocator does not grow.
pub struct BlockBookmarkStore<B: BlockBuffer> {
    state: Mutex<BlockBookmarkState<B>>,
    sync_mode: SyncMode,
    ring: bool,
}

impl BlockBookmarkStore<MmapBuffer> {
    /// Open (or create) a store file.
    pub fn open_file(path: impl AsRef<Path>, config: BlockBookmarkStoreConfig) -> StoreResult<Self> {
        Self::open(MmapBuffer::open(path)?, config)
    }
}

impl BlockBookmarkStore<MemoryBuffer> {
    /// A fixed-capacity ring on the heap.
    pub fn ring(capacity: u32) -> StoreResult<Self> {
        Self::open(MemoryBuffer::new(), BlockBookmarkStoreConfig::ring(capacity))
    }
}

impl<B: BlockBuffer> BlockBookmarkStore<B> {
    /// Open a store over `buffer`, recovering every subscription in it.
    pub fn open(buffer: B, config: BlockBookmarkStoreConfig) -> StoreResult<Self> {
        let mut allocator = BlockAllocator::open(buffer, config.allocator)?;
        let ring = allocator.growth() == Growth::Fixed;
        let mut tracker = BookmarkTracker::default();
        let mut slots: HashMap<String, Slots> = HashMap::new();

        let mut entries = Vec::new();
        for record in allocator.records()? {
            let (kind, subscription, bookmark) = decode(record.index, &record.payload)?;
            match kind {
                KIND_HEADER => {
                    let log = tracker.entry(&subscription);
                    if record.sequence > 0 {
                        log.restore_discarded(record.sequence, Bookmark::from(bookmark));
                    }
                    slots.entry(subscription).or_default().header = Some(record.index);
                }
                KIND_ENTRY => entries.push((record.index, record.sequence, subscription, bookmark)),
                other => {
                    return Err(StoreError::corrupt(
                        record.index.0,
                        format!("unknown bookmark record kind {other}"),
                    ))
                }
            }
        }

        let mut stale = Vec::new();
        for (index, entry, subscription, bookmark) in entries {
            let live = tracker
                .get(&subscription)
                .map(|log| entry > log.last_discarded_entry())
                .unwrap_or(false);
            if live && slots.contains_key(&subscription) {
                tracker.entry(&subscription).restore_log(entry, Bookmark::from(bookmark));
                slots.entry(subscription).or_default().entries.insert(entry, index);
            } else {
                stale.push(index);
            }
        }
        if !stale.is_empty() && !allocator.buffer().is_read_only() {
            warn!(count = stale.len(), "Freeing bookmark entries left by an interrupted discard");
            for index in stale {
                allocator.free(index)?;
            }
            allocator.sync()?;
        }

        info!(
            subscriptions = slots.len(),
            ring,
            capacity = allocator.capacity(),
            "Opened block bookmark store"
        );
        Ok(Self {
            state: Mutex::new(BlockBookmarkState {
                allocator,
                tracker,
                slots,
                last_sync: Instant::now(),
            }),
            sync_mode: config.sync_mode,
            ring,
        })
    }

    /// Returns `true` for a fixed-capacity ring.
    pub fn is_ring(&self) -> bool {
        self.ring
    }

    /// Slots in the region.
    pub fn capacity(&self) -> u32 {
        self.state.lock().map(|state| state.allocator.capacity()).unwrap_or(0)
    }

    /// Slots not holding any record.
    pub fn free_slots(&self) -> usize {
        self.state.lock().map(|state| state.allocator.free_blocks()).unwrap_or(0)
    }

    /// The head slot holding an undischarged entry.
    pub fn slot_of(&self, handle: &EntryHandle) -> Option<BlockIndex> {
        let state = self.state.lock().ok()?;
        state
            .slots
            .get(handle.subscription())?
            .entries
            .get(&handle.entry())
            .copied()
    }
}

impl<B: BlockBuffer> BookmarkStore for BlockBookmarkStore<B> {
    fn log(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<EntryHandle> {
        let mut guard = self.state.lock().map_err(|_| poisoned())?;
        let state = &mut *guard;

        let known = state
            .tracker
            .get(subscription)
            .and_then(|log| log.entry_of(bookmark));
        if let Some(entry) = known {
            return Ok(EntryHandle::new(subscription, entry));
        }

        if !state.slots.contains_key(subscription) {
            state.write_header(subscription, 0, "")?;
            state.tracker.entry(subscription);
        }
        let payload = encode(KIND_ENTRY, subscription, bookmark.as_str());
        let entry = state.tracker.next_entry(subscription);
        let index = state.put(entry, &payload)?;
        state.tracker.entry(subscription).log(bookmark);
        state.slots.entry(subscription.to_string()).or_default().entries.insert(entry, index);
        state.maybe_sync(self.sync_mode)?;
        Ok(EntryHandle::new(subscription, entry))
    }

    fn discard(&self, handle: &EntryHandle) -> StoreResult<()> {
        let mut guard = self.state.lock().map_err(|_| poisoned())?;
        let state = &mut *guard;
        let subscription = handle.subscription();
        let Some((entry, bookmark)) = state.tracker.discard_target(subscription, handle.entry()) else {
            return Ok(());
        };

        // The tracker only moves once the new header is written.
        match state.write_header(subscription, entry, bookmark.as_str()) {
            Ok(()) => {}
            Err(error) if error.is_capacity() => {
                // No room to move a grown header: free the covered entries
                // first, then retry.
                state.free_entries(subscription, entry)?;
                state.write_header(subscription, entry, bookmark.as_str())?;
            }
            Err(error) => return Err(error),
        }
        if let Some(log) = state.tracker.get_mut(subscription) {
            log.discard_through(entry);
        }
        let freed = state.free_entries(subscription, entry)?;
        state.maybe_sync(self.sync_mode)?;
        debug!(subscription, entry, freed, "Discarded bookmarks");
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
        if !state.tracker.contains(subscription) {
            return Ok(());
        }
        state.drop_subscription(subscription)?;
        state.maybe_sync(self.sync_mode)
    }

    fn purge(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        for subscription in state.tracker.names() {
            state.drop_subscription(&subscription)?;
        }
        state.tracker.clear();
        state.maybe_sync(self.sync_mode)
    }

    fn persist(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.allocator.sync()?;
        state.last_sync = Instant::now();
        Ok(())
    }

    fn name(&self) -> &str {
        if self.ring {
            "ring"
        } else {
            "block"
        }
    }
}

impl<B: BlockBuffer> std::fmt::Debug for BlockBookmarkStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBookmarkStore")
            .field("ring", &self.ring)
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MIN_BLOCK_SIZE;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Heap buffer whose writes can be switched off.
    struct FlakyBuffer {
        inner: MemoryBuffer,
        failing: Arc<AtomicBool>,
    }

    impl BlockBuffer for FlakyBuffer {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn is_read_only(&self) -> bool {
            false
        }

        fn grow(&mut self, new_len: u64) -> StoreResult<()> {
            self.inner.grow(new_len)
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_at(offset, data)
        }

        fn sync(&mut self) -> StoreResult<()> {
            self.inner.sync()
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn bm(value: &str) -> Bookmark {
        Bookmark::from(value)
    }

    fn small_ring(capacity: u32) -> BlockBookmarkStore<MemoryBuffer> {
        let mut config = BlockBookmarkStoreConfig::ring(capacity);
        config.allocator.block_size = MIN_BLOCK_SIZE;
        BlockBookmarkStore::open(MemoryBuffer::new(), config).unwrap()
    }

    #[test]
    fn test_ring_full_then_reuses_discarded_slot() {
        // One slot goes to the subscription header, three to entries.
        let store = small_ring(4);
        let first = store.log("sub", &bm("1")).unwrap();
        store.log("sub", &bm("2")).unwrap();
        store.log("sub", &bm("3")).unwrap();
        let freed_slot = store.slot_of(&first).unwrap();

        let error = store.log("sub", &bm("4")).unwrap_err();
        assert!(matches!(error, StoreError::BookmarkStoreFull { capacity: 4 }));
        assert_eq!(store.oldest_unprocessed("sub"), Some(bm("1")));

        store.discard(&first).unwrap();
        let fourth = store.log("sub", &bm("4")).unwrap();
        assert_eq!(store.slot_of(&fourth), Some(freed_slot));
        assert_eq!(fourth.entry(), 4);
    }

    #[test]
    fn test_failed_log_does_not_consume_entry_number() {
        let store = small_ring(2);
        store.log("sub", &bm("a")).unwrap();
        assert!(store.log("sub", &bm("b")).is_err());
        assert!(!store.is_discarded("sub", &bm("b")));
        store.discard_bookmark("sub", &bm("a")).unwrap();
        assert_eq!(store.log("sub", &bm("b")).unwrap().entry(), 2);
    }

    #[test]
    fn test_failed_discard_leaves_state_alone() {
        let failing = Arc::new(AtomicBool::new(false));
        let buffer = FlakyBuffer {
            inner: MemoryBuffer::new(),
            failing: Arc::clone(&failing),
        };
        let store = BlockBookmarkStore::open(buffer, BlockBookmarkStoreConfig::default()).unwrap();
        let first = store.log("sub", &bm("1")).unwrap();
        let second = store.log("sub", &bm("2")).unwrap();
        store.discard(&first).unwrap();
        let second_slot = store.slot_of(&second);
        let free = store.free_slots();

        failing.store(true, Ordering::SeqCst);
        assert!(store.discard(&second).is_err());
        assert_eq!(store.get_most_recent("sub"), Some(bm("1")));
        assert_eq!(store.oldest_unprocessed("sub"), Some(bm("2")));
        assert!(!store.is_discarded("sub", &bm("2")));
        assert_eq!(store.slot_of(&second), second_slot);
        assert_eq!(store.free_slots(), free);

        failing.store(false, Ordering::SeqCst);
        store.discard(&second).unwrap();
        assert_eq!(store.get_most_recent("sub"), Some(bm("2")));
    }

    #[test]
    fn test_block_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bookmarks.blk");
        {
            let store = BlockBookmarkStore::open_file(&path, BlockBookmarkStoreConfig::default()).unwrap();
            store.log("orders", &bm("o1")).unwrap();
            let o2 = store.log("orders", &bm("o2")).unwrap();
            store.log("orders", &bm("o3")).unwrap();
            store.log("fills", &bm("f1")).unwrap();
            store.discard(&o2).unwrap();
        }

        let store = BlockBookmarkStore::open_file(&path, BlockBookmarkStoreConfig::default()).unwrap();
        assert!(!store.is_ring());
        assert_eq!(store.get_most_recent("orders"), Some(bm("o2")));
        assert_eq!(store.oldest_unprocessed("orders"), Some(bm("o3")));
        assert_eq!(store.get_most_recent("fills"), None);
        assert_eq!(store.log("orders", &bm("o4")).unwrap().entry(), 4);
    }

    #[test]
    fn test_header_grows_with_long_bookmark() {
        let store = small_ring(8);
        let long = "x".repeat(300);
        let handle = store.log("sub", &bm(&long)).unwrap();
        store.discard(&handle).unwrap();
        assert_eq!(store.get_most_recent("sub"), Some(bm(&long)));
        assert!(store.is_discarded("sub", &bm(&long)));
    }

    #[test]
    fn test_purge_frees_every_slot() {
        let store = small_ring(6);
        store.log("a", &bm("1")).unwrap();
        store.log("b", &bm("1")).unwrap();
        store.purge_subscription("a").unwrap();
        assert_eq!(store.subscriptions(), vec!["b".to_string()]);
        store.purge().unwrap();
        assert_eq!(store.free_slots(), 6);
    }
}
