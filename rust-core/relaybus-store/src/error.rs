// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every failure a store can report to its caller. Capacity exhaustion and
// corruption are never swallowed inside the crate: they always surface as
// one of these variants on the operation that triggered them.

use thiserror::Error;

/// Errors that can occur in the block allocator and the stores built on it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred while reading, writing or mapping a backing file.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block region has no free block left and cannot grow, either
    /// because growth is disabled or because the backing medium is read-only.
    #[error("store full: {capacity} blocks in use and the region cannot grow")]
    StoreFull {
        /// Number of data blocks in the region.
        capacity: u32,
    },

    /// A fixed-capacity bookmark store has no discardable entry to reclaim.
    #[error("bookmark store full: all {capacity} slots hold undischarged state")]
    BookmarkStoreFull {
        /// Number of slots in the ring.
        capacity: u32,
    },

    /// Persisted data failed validation. The store instance must not be
    /// used further without operator intervention or a fresh store.
    #[error("store corrupt at block {index}: {reason}")]
    StoreCorrupt {
        /// Index of the block (or journal record) that failed validation;
        /// `u32::MAX` for the region header.
        index: u32,
        /// What the validation found.
        reason: String,
    },

    /// The backing region was written by an incompatible format version.
    #[error("incompatible store version: found {found}, expected {expected}")]
    IncompatibleStoreVersion {
        /// Version recorded in the region header.
        found: u32,
        /// Version this build reads and writes.
        expected: u32,
    },

    /// A mutation was attempted on a read-only backing medium.
    #[error("store is read-only")]
    ReadOnly,

    /// A block index that does not name an occupied record head.
    #[error("invalid block index {0}")]
    InvalidBlock(u32),

    /// A payload does not fit in the blocks reserved for it.
    #[error("payload of {size} bytes exceeds the {reserved} bytes reserved")]
    PayloadTooLarge {
        /// Size of the payload offered to `write`.
        size: usize,
        /// Payload bytes available in the reserved chain.
        reserved: usize,
    },

    /// `flush` gave up before every pending record was acknowledged.
    #[error("flush timed out with {remaining} records still pending")]
    FlushTimeout {
        /// Records still pending when the wait expired.
        remaining: usize,
    },

    /// JSON serialization or deserialization of a snapshot failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An external recovery-point backend reported a failure.
    #[error("recovery point backend error: {0}")]
    Backend(String),

    /// A replay visitor refused a record; replay stopped at `sequence`.
    #[error("replay stopped at sequence {sequence}: {reason}")]
    Replay {
        /// The record the visitor rejected.
        sequence: u64,
        /// The visitor's reason.
        reason: String,
    },
}

impl StoreError {
    /// Shorthand for building a [`StoreError::StoreCorrupt`].
    pub fn corrupt(index: u32, reason: impl Into<String>) -> Self {
        Self::StoreCorrupt {
            index,
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that mean "out of room" rather than
    /// "broken", i.e. the caller may retry after acknowledgements arrive.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            StoreError::StoreFull { .. } | StoreError::BookmarkStoreFull { .. }
        )
    }
}

/// Convenience type alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;
