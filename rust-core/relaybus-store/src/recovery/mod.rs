// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Recovery point adapters
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A recovery point is the one bookmark per subscription needed to resume
// it, kept apart from the full bookmark log so startup does not have to
// replay that log. Adapters are async because the server-of-record variant
// asks the server, and the file and redb variants do blocking I/O off the
// runtime's worker threads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bookmark::Bookmark;
use crate::error::StoreResult;

pub mod conflating;
pub mod file;
#[cfg(feature = "redb-backend")]
pub mod redb_backend;
pub mod server;

pub use conflating::ConflatingRecoveryPointAdapter;
pub use file::FileRecoveryPointAdapter;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbRecoveryPointAdapter;
pub use server::{MemoryRecoveryPointSource, RecoveryPointSource, ServerRecoveryPointAdapter};

/// The resume state of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub bookmark: Bookmark,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryPoint {
    pub fn now(bookmark: Bookmark) -> Self {
        Self {
            bookmark,
            updated_at: Utc::now(),
        }
    }
}

/// Persists and restores recovery points.
///
/// `load` returning `Ok(None)` means the subscription has no recovery
/// point and should start from the beginning of its stream.
#[async_trait]
pub trait RecoveryPointAdapter: Send + Sync {
    /// The recovery point of one subscription.
    async fn load(&self, subscription: &str) -> StoreResult<Option<Bookmark>>;

    /// Record a new recovery point, replacing the previous one.
    async fn save(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()>;

    /// Every recovery point the adapter knows.
    async fn load_all(&self) -> StoreResult<BTreeMap<String, Bookmark>>;

    /// Forget one subscription's recovery point.
    async fn purge(&self, subscription: &str) -> StoreResult<()>;

    /// Push anything buffered to the underlying medium.
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Short label for logs.
    fn name(&self) -> &str;
}
