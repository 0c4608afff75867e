// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - In-memory bookmark store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::sync::Mutex;

use crate::bookmark::tracker::BookmarkTracker;
use crate::bookmark::{Bookmark, BookmarkStore, EntryHandle};
use crate::error::StoreResult;
use crate::publish::poisoned;

/// Bookmark state on the heap. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBookmarkStore {
    tracker: Mutex<BookmarkTracker>,
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BookmarkStore for MemoryBookmarkStore {
    fn log(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<EntryHandle> {
        let mut tracker = self.tracker.lock().map_err(|_| poisoned())?;
        let entry = tracker.entry(subscription).log(bookmark).entry();
        Ok(EntryHandle::new(subscription, entry))
    }

    fn discard(&self, handle: &EntryHandle) -> StoreResult<()> {
        let mut tracker = self.tracker.lock().map_err(|_| poisoned())?;
        if let Some(log) = tracker.get_mut(handle.subscription()) {
            log.discard_through(handle.entry());
        }
        Ok(())
    }

    fn discard_bookmark(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        let mut tracker = self.tracker.lock().map_err(|_| poisoned())?;
        if let Some(log) = tracker.get_mut(subscription) {
            if let Some(entry) = log.live_entry(bookmark) {
                log.discard_through(entry);
            }
        }
        Ok(())
    }

    fn get_most_recent(&self, subscription: &str) -> Option<Bookmark> {
        self.tracker.lock().ok()?.most_recent(subscription)
    }

    fn is_discarded(&self, subscription: &str, bookmark: &Bookmark) -> bool {
        self.tracker
            .lock()
            .map(|tracker| tracker.is_discarded(subscription, bookmark))
            .unwrap_or(false)
    }

    fn oldest_unprocessed(&self, subscription: &str) -> Option<Bookmark> {
        self.tracker.lock().ok()?.oldest_unprocessed(subscription)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.tracker.lock().map(|tracker| tracker.names()).unwrap_or_default()
    }

    fn purge_subscription(&self, subscription: &str) -> StoreResult<()> {
        self.tracker.lock().map_err(|_| poisoned())?.remove(subscription);
        Ok(())
    }

    fn purge(&self) -> StoreResult<()> {
        self.tracker.lock().map_err(|_| poisoned())?.clear();
        Ok(())
    }

    fn persist(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_recent_is_monotonic() {
        let store = MemoryBookmarkStore::new();
        let handles: Vec<EntryHandle> = ["1|a", "1|b", "1|c"]
            .iter()
            .map(|value| store.log("sub", &Bookmark::from(*value)).unwrap())
            .collect();

        store.discard(&handles[1]).unwrap();
        assert_eq!(store.get_most_recent("sub"), Some(Bookmark::from("1|b")));
        store.discard(&handles[0]).unwrap();
        assert_eq!(store.get_most_recent("sub"), Some(Bookmark::from("1|b")));
        store.discard(&handles[2]).unwrap();
        assert_eq!(store.get_most_recent("sub"), Some(Bookmark::from("1|c")));
    }

    #[test]
    fn test_subscriptions_are_independent() {
        let store = MemoryBookmarkStore::new();
        let a = store.log("alpha", &Bookmark::from("x")).unwrap();
        store.log("beta", &Bookmark::from("x")).unwrap();
        store.discard(&a).unwrap();

        assert!(store.is_discarded("alpha", &Bookmark::from("x")));
        assert!(!store.is_discarded("beta", &Bookmark::from("x")));
        assert_eq!(store.subscriptions(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_discard_bookmark_and_purge() {
        let store = MemoryBookmarkStore::new();
        store.log("sub", &Bookmark::from("a")).unwrap();
        store.log("sub", &Bookmark::from("b")).unwrap();
        store.discard_bookmark("sub", &Bookmark::from("a")).unwrap();
        assert_eq!(store.oldest_unprocessed("sub"), Some(Bookmark::from("b")));

        store.purge_subscription("sub").unwrap();
        assert_eq!(store.get_most_recent("sub"), None);
        assert!(store.subscriptions().is_empty());
    }

    #[test]
    fn test_unknown_subscription_discard_is_noop() {
        let store = MemoryBookmarkStore::new();
        let handle = EntryHandle::new("ghost", 3);
        store.discard(&handle).unwrap();
        store.discard_bookmark("ghost", &Bookmark::from("z")).unwrap();
        assert!(store.subscriptions().is_empty());
    }
}
