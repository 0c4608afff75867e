// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - In-memory bookmark bookkeeping
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared by every bookmark store variant. The durable variants keep a
// `BookmarkTracker` as their view of the state and write each change
// through to their own medium.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::bookmark::{Bookmark, DISCARDED_HISTORY};

const FIRST_ENTRY: u64 = 1;

/// Outcome of logging a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Logged {
    /// The bookmark was new and got this entry number.
    New(u64),
    /// The bookmark was already known under this entry number.
    Existing(u64),
}

impl Logged {
    pub(crate) fn entry(self) -> u64 {
        match self {
            Logged::New(entry) | Logged::Existing(entry) => entry,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubscriptionLog {
    next_entry: u64,
    live: BTreeMap<u64, Bookmark>,
    live_index: HashMap<Bookmark, u64>,
    last_discarded: Option<(u64, Bookmark)>,
    history: VecDeque<Bookmark>,
    history_index: HashMap<Bookmark, u64>,
}

impl Default for SubscriptionLog {
    fn default() -> Self {
        Self {
            next_entry: FIRST_ENTRY,
            live: BTreeMap::new(),
            live_index: HashMap::new(),
            last_discarded: None,
            history: VecDeque::new(),
            history_index: HashMap::new(),
        }
    }
}

impl SubscriptionLog {
    pub(crate) fn log(&mut self, bookmark: &Bookmark) -> Logged {
        if let Some(entry) = self.entry_of(bookmark) {
            return Logged::Existing(entry);
        }
        let entry = self.next_entry;
        self.insert_live(entry, bookmark.clone());
        Logged::New(entry)
    }

    /// Re-insert an entry read back from durable storage.
    pub(crate) fn restore_log(&mut self, entry: u64, bookmark: Bookmark) {
        if entry <= self.last_discarded_entry() {
            return;
        }
        self.insert_live(entry, bookmark);
    }

    /// Re-establish the discard point read back from durable storage.
    pub(crate) fn restore_discarded(&mut self, entry: u64, bookmark: Bookmark) {
        if entry <= self.last_discarded_entry() {
            return;
        }
        let stale: Vec<u64> = self.live.range(..=entry).map(|(entry, _)| *entry).collect();
        for stale_entry in stale {
            if let Some(bookmark) = self.live.remove(&stale_entry) {
                self.live_index.remove(&bookmark);
                self.remember_discarded(stale_entry, bookmark);
            }
        }
        self.next_entry = self.next_entry.max(entry + 1);
        self.remember_discarded(entry, bookmark.clone());
        self.last_discarded = Some((entry, bookmark));
    }

    /// Discard `entry` and everything before it. Returns the entries that
    /// changed state, oldest first; empty means nothing changed.
    pub(crate) fn discard_through(&mut self, entry: u64) -> Vec<(u64, Bookmark)> {
        if entry <= self.last_discarded_entry() || entry >= self.next_entry {
            return Vec::new();
        }
        let retained = self.live.split_off(&(entry + 1));
        let removed: Vec<(u64, Bookmark)> = std::mem::replace(&mut self.live, retained)
            .into_iter()
            .collect();
        for (removed_entry, bookmark) in &removed {
            self.live_index.remove(bookmark);
            self.remember_discarded(*removed_entry, bookmark.clone());
        }
        if let Some(last) = removed.last() {
            self.last_discarded = Some(last.clone());
        }
        removed
    }

    /// The entry `discard_through(entry)` would record as the new discard
    /// point, without changing anything.
    pub(crate) fn discard_target(&self, entry: u64) -> Option<(u64, Bookmark)> {
        if entry <= self.last_discarded_entry() || entry >= self.next_entry {
            return None;
        }
        self.live
            .range(..=entry)
            .next_back()
            .map(|(entry, bookmark)| (*entry, bookmark.clone()))
    }

    pub(crate) fn entry_of(&self, bookmark: &Bookmark) -> Option<u64> {
        self.live_index
            .get(bookmark)
            .or_else(|| self.history_index.get(bookmark))
            .copied()
    }

    pub(crate) fn live_entry(&self, bookmark: &Bookmark) -> Option<u64> {
        self.live_index.get(bookmark).copied()
    }

    pub(crate) fn most_recent(&self) -> Option<&Bookmark> {
        self.last_discarded.as_ref().map(|(_, bookmark)| bookmark)
    }

    pub(crate) fn last_discarded_entry(&self) -> u64 {
        self.last_discarded.as_ref().map(|(entry, _)| *entry).unwrap_or(0)
    }

    pub(crate) fn is_discarded(&self, bookmark: &Bookmark) -> bool {
        self.history_index.contains_key(bookmark)
    }

    pub(crate) fn oldest_unprocessed(&self) -> Option<&Bookmark> {
        self.live.values().next()
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = (&u64, &Bookmark)> {
        self.live.iter()
    }

    pub(crate) fn last_discarded(&self) -> Option<&(u64, Bookmark)> {
        self.last_discarded.as_ref()
    }

    fn insert_live(&mut self, entry: u64, bookmark: Bookmark) {
        self.live_index.insert(bookmark.clone(), entry);
        self.live.insert(entry, bookmark);
        self.next_entry = self.next_entry.max(entry + 1);
    }

    fn remember_discarded(&mut self, entry: u64, bookmark: Bookmark) {
        if self.history_index.insert(bookmark.clone(), entry).is_none() {
            self.history.push_back(bookmark);
        }
        while self.history.len() > DISCARDED_HISTORY {
            if let Some(oldest) = self.history.pop_front() {
                self.history_index.remove(&oldest);
            }
        }
    }
}

/// Every subscription's log, keyed by subscription id.
#[derive(Debug, Default)]
pub(crate) struct BookmarkTracker {
    subscriptions: BTreeMap<String, SubscriptionLog>,
}

impl BookmarkTracker {
    pub(crate) fn get(&self, subscription: &str) -> Option<&SubscriptionLog> {
        self.subscriptions.get(subscription)
    }

    pub(crate) fn get_mut(&mut self, subscription: &str) -> Option<&mut SubscriptionLog> {
        self.subscriptions.get_mut(subscription)
    }

    pub(crate) fn entry(&mut self, subscription: &str) -> &mut SubscriptionLog {
        self.subscriptions.entry(subscription.to_string()).or_default()
    }

    pub(crate) fn contains(&self, subscription: &str) -> bool {
        self.subscriptions.contains_key(subscription)
    }

    pub(crate) fn remove(&mut self, subscription: &str) -> Option<SubscriptionLog> {
        self.subscriptions.remove(subscription)
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &SubscriptionLog)> {
        self.subscriptions.iter()
    }

    /// The entry number the next new bookmark on `subscription` gets.
    pub(crate) fn next_entry(&self, subscription: &str) -> u64 {
        self.get(subscription).map_or(FIRST_ENTRY, |log| log.next_entry)
    }

    pub(crate) fn discard_target(&self, subscription: &str, entry: u64) -> Option<(u64, Bookmark)> {
        self.get(subscription).and_then(|log| log.discard_target(entry))
    }

    pub(crate) fn most_recent(&self, subscription: &str) -> Option<Bookmark> {
        self.get(subscription).and_then(|log| log.most_recent().cloned())
    }

    pub(crate) fn is_discarded(&self, subscription: &str, bookmark: &Bookmark) -> bool {
        self.get(subscription)
            .map(|log| log.is_discarded(bookmark))
            .unwrap_or(false)
    }

    pub(crate) fn oldest_unprocessed(&self, subscription: &str) -> Option<Bookmark> {
        self.get(subscription)
            .and_then(|log| log.oldest_unprocessed().cloned())
    }
}
