// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - redb recovery points
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One row per subscription in a single redb file. Every save is its own
// write transaction, which redb makes durable on commit. All database work
// runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::bookmark::Bookmark;
use crate::error::{StoreError, StoreResult};
use crate::recovery::{RecoveryPoint, RecoveryPointAdapter};

/// Subscription id to JSON-encoded `RecoveryPoint`.
const POINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("recovery_points");

/// Recovery points in an embedded redb database.
pub struct RedbRecoveryPointAdapter {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbRecoveryPointAdapter {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path).map_err(|e| {
            StoreError::Backend(format!("failed to open redb at {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Opened redb recovery point store");

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RedbRecoveryPointAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecoveryPointAdapter")
            .field("path", &self.path)
            .finish()
    }
}

fn decode(subscription: &str, bytes: &[u8]) -> StoreResult<Bookmark> {
    let point: RecoveryPoint = serde_json::from_slice(bytes).map_err(|e| {
        StoreError::Backend(format!("recovery point for {subscription}: {e}"))
    })?;
    Ok(point.bookmark)
}

#[async_trait]
impl RecoveryPointAdapter for RedbRecoveryPointAdapter {
    async fn load(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        let db = Arc::clone(&self.db);
        let subscription = subscription.to_string();

        tokio::task::spawn_blocking(move || -> StoreResult<Option<Bookmark>> {
            let txn = db
                .begin_read()
                .map_err(|e| StoreError::Backend(format!("read txn: {e}")))?;
            let table = match txn.open_table(POINTS_TABLE) {
                Ok(t) => t,
                // Nothing saved yet
                Err(_) => return Ok(None),
            };
            match table.get(subscription.as_str()) {
                Ok(Some(value)) => decode(&subscription, value.value()).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(StoreError::Backend(format!("get: {e}"))),
            }
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }

    async fn save(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        let db = Arc::clone(&self.db);
        let subscription = subscription.to_string();
        let encoded = serde_json::to_vec(&RecoveryPoint::now(bookmark.clone()))?;

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let txn = db
                .begin_write()
                .map_err(|e| StoreError::Backend(format!("write txn: {e}")))?;
            {
                let mut table = txn
                    .open_table(POINTS_TABLE)
                    .map_err(|e| StoreError::Backend(format!("open table: {e}")))?;
                table
                    .insert(subscription.as_str(), encoded.as_slice())
                    .map_err(|e| StoreError::Backend(format!("insert: {e}")))?;
            }
            txn.commit()
                .map_err(|e| StoreError::Backend(format!("commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }

    async fn load_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || -> StoreResult<BTreeMap<String, Bookmark>> {
            let txn = db
                .begin_read()
                .map_err(|e| StoreError::Backend(format!("read txn: {e}")))?;
            let table = match txn.open_table(POINTS_TABLE) {
                Ok(t) => t,
                Err(_) => return Ok(BTreeMap::new()),
            };

            let mut points = BTreeMap::new();
            let iter = table
                .iter()
                .map_err(|e| StoreError::Backend(format!("iterate: {e}")))?;
            for entry in iter {
                let (key, value) = entry.map_err(|e| StoreError::Backend(format!("entry: {e}")))?;
                let subscription = key.value().to_string();
                let bookmark = decode(&subscription, value.value())?;
                points.insert(subscription, bookmark);
            }
            Ok(points)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }

    async fn purge(&self, subscription: &str) -> StoreResult<()> {
        let db = Arc::clone(&self.db);
        let subscription = subscription.to_string();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let txn = db
                .begin_write()
                .map_err(|e| StoreError::Backend(format!("write txn: {e}")))?;
            {
                let mut table = txn
                    .open_table(POINTS_TABLE)
                    .map_err(|e| StoreError::Backend(format!("open table: {e}")))?;
                table
                    .remove(subscription.as_str())
                    .map_err(|e| StoreError::Backend(format!("remove: {e}")))?;
            }
            txn.commit()
                .map_err(|e| StoreError::Backend(format!("commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }

    fn name(&self) -> &str {
        "redb"
    }
}
