// SPDX-License-Identifier: PMPL-1.0-or-later
//! Store selection.
//!
//! Each store family has one serde enum naming its variant and that
//! variant's parameters. `open` builds the store behind its trait object so
//! the client never names a concrete store type.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bookmark::{
    BlockBookmarkStore, BlockBookmarkStoreConfig, BookmarkStore, LoggedBookmarkStore,
    MemoryBookmarkStore,
};
use crate::error::{StoreError, StoreResult};
use crate::publish::{
    BlockPublishStore, BlockPublishStoreConfig, HybridFlushPolicy, HybridPublishStore,
    MemoryPublishStore, PublishStore, SyncMode,
};
use crate::recovery::{
    ConflatingRecoveryPointAdapter, FileRecoveryPointAdapter, RecoveryPointAdapter,
    RecoveryPointSource, ServerRecoveryPointAdapter,
};

/// Which publish store the client uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublishStoreConfig {
    /// Lost on restart.
    Memory,
    /// Every record written to a block file before `store` returns.
    Persistent {
        path: PathBuf,
        #[serde(default)]
        store: BlockPublishStoreConfig,
    },
    /// Buffered in memory, spilled to a block file.
    Hybrid {
        path: PathBuf,
        #[serde(default)]
        store: BlockPublishStoreConfig,
        #[serde(default)]
        policy: HybridFlushPolicy,
    },
}

impl Default for PublishStoreConfig {
    fn default() -> Self {
        PublishStoreConfig::Memory
    }
}

impl PublishStoreConfig {
    /// Open (or create) the configured store.
    ///
    /// A hybrid store with a flush interval gets a background flusher when
    /// called inside a tokio runtime; outside one the interval is ignored
    /// and only the buffer limit triggers spills.
    pub fn open(&self) -> StoreResult<Arc<dyn PublishStore>> {
        match self {
            PublishStoreConfig::Memory => Ok(Arc::new(MemoryPublishStore::new())),
            PublishStoreConfig::Persistent { path, store } => {
                let store = BlockPublishStore::open_file(path, store.clone())?;
                info!(path = %path.display(), next_sequence = store.next_sequence(), "Opened persistent publish store");
                Ok(Arc::new(store))
            }
            PublishStoreConfig::Hybrid {
                path,
                store,
                policy,
            } => {
                let durable = BlockPublishStore::open_file(path, store.clone())?;
                let hybrid = Arc::new(HybridPublishStore::new(durable, policy.clone()));
                if let Some(interval) = policy.interval {
                    if tokio::runtime::Handle::try_current().is_ok() {
                        hybrid.spawn_flusher(interval);
                    } else {
                        warn!(path = %path.display(), "No tokio runtime; hybrid flush interval ignored");
                    }
                }
                Ok(hybrid as Arc<dyn PublishStore>)
            }
        }
    }
}

/// Which bookmark store the client uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookmarkStoreConfig {
    Memory,
    /// Append-only journal file.
    Logged {
        path: PathBuf,
        #[serde(default)]
        sync_mode: SyncMode,
    },
    /// Growable block file.
    Mmap {
        path: PathBuf,
        #[serde(default)]
        store: BlockBookmarkStoreConfig,
    },
    /// Fixed number of slots, in a file when `path` is set.
    Ring {
        capacity: u32,
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for BookmarkStoreConfig {
    fn default() -> Self {
        BookmarkStoreConfig::Memory
    }
}

impl BookmarkStoreConfig {
    pub fn open(&self) -> StoreResult<Arc<dyn BookmarkStore>> {
        match self {
            BookmarkStoreConfig::Memory => Ok(Arc::new(MemoryBookmarkStore::new())),
            BookmarkStoreConfig::Logged { path, sync_mode } => {
                Ok(Arc::new(LoggedBookmarkStore::open(path, *sync_mode)?))
            }
            BookmarkStoreConfig::Mmap { path, store } => {
                Ok(Arc::new(BlockBookmarkStore::open_file(path, store.clone())?))
            }
            BookmarkStoreConfig::Ring { capacity, path } => match path {
                Some(path) => Ok(Arc::new(BlockBookmarkStore::open_file(
                    path,
                    BlockBookmarkStoreConfig::ring(*capacity),
                )?)),
                None => Ok(Arc::new(BlockBookmarkStore::ring(*capacity)?)),
            },
        }
    }
}

/// Buffering in front of a recovery point adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflationConfig {
    /// Pending subscriptions that force a write.
    #[serde(default = "default_update_threshold")]
    pub update_threshold: usize,
    /// Background flush period.
    #[serde(default)]
    pub interval: Option<Duration>,
}

fn default_update_threshold() -> usize {
    10
}

impl Default for ConflationConfig {
    fn default() -> Self {
        Self {
            update_threshold: default_update_threshold(),
            interval: None,
        }
    }
}

/// Where recovery points live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryPointConfig {
    /// No recovery points; resubscribe uses the bookmark store alone.
    #[default]
    None,
    /// JSON snapshot file.
    Local {
        path: PathBuf,
        #[serde(default)]
        conflation: Option<ConflationConfig>,
    },
    /// redb database file.
    Redb {
        path: PathBuf,
        #[serde(default)]
        conflation: Option<ConflationConfig>,
    },
    /// Ask the server.
    Server,
}

impl RecoveryPointConfig {
    /// Build the adapter. `source` is consulted only for `Server`.
    pub async fn open(
        &self,
        source: Option<Arc<dyn RecoveryPointSource>>,
    ) -> StoreResult<Option<Arc<dyn RecoveryPointAdapter>>> {
        match self {
            RecoveryPointConfig::None => Ok(None),
            RecoveryPointConfig::Local { path, conflation } => {
                let adapter = FileRecoveryPointAdapter::open(path).await?;
                Ok(Some(conflate(adapter, conflation.as_ref())))
            }
            #[cfg(feature = "redb-backend")]
            RecoveryPointConfig::Redb { path, conflation } => {
                let adapter = crate::recovery::RedbRecoveryPointAdapter::open(path)?;
                Ok(Some(conflate(adapter, conflation.as_ref())))
            }
            #[cfg(not(feature = "redb-backend"))]
            RecoveryPointConfig::Redb { .. } => Err(StoreError::Backend(
                "redb recovery points need the redb-backend feature".to_string(),
            )),
            RecoveryPointConfig::Server => match source {
                Some(source) => Ok(Some(Arc::new(ServerRecoveryPointAdapter::new(source)))),
                None => Err(StoreError::Backend(
                    "server recovery points need a connection to ask".to_string(),
                )),
            },
        }
    }
}

fn conflate<A: RecoveryPointAdapter + 'static>(
    adapter: A,
    conflation: Option<&ConflationConfig>,
) -> Arc<dyn RecoveryPointAdapter> {
    let Some(conflation) = conflation else {
        return Arc::new(adapter);
    };
    let wrapped = Arc::new(ConflatingRecoveryPointAdapter::new(
        adapter,
        conflation.update_threshold,
    ));
    if let Some(interval) = conflation.interval {
        if tokio::runtime::Handle::try_current().is_ok() {
            wrapped.spawn_flusher(interval);
        }
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_publish_config_from_json() {
        let config: PublishStoreConfig = serde_json::from_str(
            r#"{"kind": "hybrid", "path": "/var/lib/relaybus/publish.blk", "policy": {"max_buffered": 32}}"#,
        )
        .unwrap();
        match config {
            PublishStoreConfig::Hybrid { policy, store, .. } => {
                assert_eq!(policy.max_buffered, 32);
                assert_eq!(store.reclaim_batch, 64);
                assert_eq!(store.sync_mode, SyncMode::Fsync);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_open_each_bookmark_kind() {
        let dir = TempDir::new().unwrap();
        let configs = [
            BookmarkStoreConfig::Memory,
            BookmarkStoreConfig::Logged {
                path: dir.path().join("bookmarks.log"),
                sync_mode: SyncMode::Async,
            },
            BookmarkStoreConfig::Mmap {
                path: dir.path().join("bookmarks.blk"),
                store: BlockBookmarkStoreConfig::default(),
            },
            BookmarkStoreConfig::Ring {
                capacity: 8,
                path: None,
            },
        ];
        for config in configs {
            let store = config.open().unwrap();
            let handle = store.log("orders", &"1|1".into()).unwrap();
            store.discard(&handle).unwrap();
            assert_eq!(store.get_most_recent("orders"), Some("1|1".into()));
        }
    }

    #[test]
    fn test_persistent_publish_config_reopens() {
        let dir = TempDir::new().unwrap();
        let config = PublishStoreConfig::Persistent {
            path: dir.path().join("publish.blk"),
            store: BlockPublishStoreConfig::default(),
        };
        {
            let store = config.open().unwrap();
            store.store(b"one").unwrap();
            store.store(b"two").unwrap();
        }
        let store = config.open().unwrap();
        assert_eq!(store.unpersisted_count(), 2);
        assert_eq!(store.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_server_recovery_needs_source() {
        let error = RecoveryPointConfig::Server.open(None).await.err().unwrap();
        assert!(matches!(error, StoreError::Backend(_)));
        assert!(RecoveryPointConfig::None.open(None).await.unwrap().is_none());
    }
}
