// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Bookmark store contract
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A bookmark store records, per subscription, every message bookmark that
// has been delivered and which of them the application has finished
// processing. On reconnect the most recently discarded bookmark is where
// the subscription resumes.
//
// Bookmarks are opaque strings. Their order within a subscription is the
// order in which they were logged; each logged bookmark gets an entry
// number from a per-subscription counter, and discarding an entry discards
// every earlier entry of the same subscription too.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

pub mod block;
pub mod logged;
pub mod memory;
mod tracker;

pub use block::{BlockBookmarkStore, BlockBookmarkStoreConfig};
pub use logged::LoggedBookmarkStore;
pub use memory::MemoryBookmarkStore;

/// Discarded bookmarks remembered per subscription for duplicate detection.
pub const DISCARDED_HISTORY: usize = 1024;

/// An opaque, per-subscription position in a message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark(String);

impl Bookmark {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Bookmark {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Bookmark {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one logged bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryHandle {
    subscription: String,
    entry: u64,
}

impl EntryHandle {
    pub(crate) fn new(subscription: &str, entry: u64) -> Self {
        Self {
            subscription: subscription.to_string(),
            entry,
        }
    }

    /// The subscription the bookmark was logged for.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Arrival number of the bookmark within its subscription (from 1).
    pub fn entry(&self) -> u64 {
        self.entry
    }
}

/// The capability every bookmark store variant provides.
///
/// Mutations for one subscription apply in the order the caller issues
/// them; each store serialises its state behind a single mutex.
pub trait BookmarkStore: Send + Sync {
    /// Record that `bookmark` was delivered for `subscription`. Logging a
    /// bookmark the store already knows returns its existing handle.
    fn log(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<EntryHandle>;

    /// Mark the entry and every earlier entry of its subscription as
    /// processed. Already-discarded and unknown entries are a no-op.
    fn discard(&self, handle: &EntryHandle) -> StoreResult<()>;

    /// [`discard`](Self::discard) by bookmark value.
    fn discard_bookmark(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()>;

    /// The resume point: the most recently discarded bookmark.
    fn get_most_recent(&self, subscription: &str) -> Option<Bookmark>;

    /// Returns `true` if `bookmark` was logged and has since been
    /// discarded, i.e. a redelivery of it is a duplicate.
    fn is_discarded(&self, subscription: &str, bookmark: &Bookmark) -> bool;

    /// The earliest delivered bookmark not yet discarded.
    fn oldest_unprocessed(&self, subscription: &str) -> Option<Bookmark>;

    /// Every subscription the store holds state for, sorted.
    fn subscriptions(&self) -> Vec<String>;

    /// Forget everything about one subscription.
    fn purge_subscription(&self, subscription: &str) -> StoreResult<()>;

    /// Forget everything.
    fn purge(&self) -> StoreResult<()>;

    /// Force pending state to durable storage. A no-op for memory stores.
    fn persist(&self) -> StoreResult<()>;

    /// Short label for logs.
    fn name(&self) -> &str;
}
