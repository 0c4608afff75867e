// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Local file recovery points
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The whole map is kept in memory and written as one JSON snapshot on every
// save: conflated to the latest bookmark per subscription, so the file
// never grows with traffic. Snapshots are written to a temporary file,
// synced, and renamed over the previous one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bookmark::Bookmark;
use crate::error::{StoreError, StoreResult};
use crate::recovery::{RecoveryPoint, RecoveryPointAdapter};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    points: BTreeMap<String, RecoveryPoint>,
}

/// Recovery points in a local JSON file.
#[derive(Debug)]
pub struct FileRecoveryPointAdapter {
    path: PathBuf,
    points: RwLock<BTreeMap<String, RecoveryPoint>>,
}

impl FileRecoveryPointAdapter {
    /// Open the snapshot at `path`. A missing file is an empty snapshot.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let points = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::IncompatibleStoreVersion {
                        found: snapshot.version,
                        expected: SNAPSHOT_VERSION,
                    });
                }
                snapshot.points
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };
        info!(path = %path.display(), subscriptions = points.len(), "Opened recovery point file");
        Ok(Self {
            path,
            points: RwLock::new(points),
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_snapshot(&self, points: &BTreeMap<String, RecoveryPoint>) -> StoreResult<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            points: points.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let temp_path = path.with_extension("tmp");
            {
                use std::io::Write;
                let mut temp = std::fs::File::create(&temp_path)?;
                temp.write_all(&bytes)?;
                temp.sync_all()?;
            }
            std::fs::rename(&temp_path, &path)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }
}

#[async_trait]
impl RecoveryPointAdapter for FileRecoveryPointAdapter {
    async fn load(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        let points = self.points.read().await;
        Ok(points.get(subscription).map(|point| point.bookmark.clone()))
    }

    async fn save(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        let mut points = self.points.write().await;
        points.insert(subscription.to_string(), RecoveryPoint::now(bookmark.clone()));
        self.write_snapshot(&points).await?;
        debug!(subscription, %bookmark, "Saved recovery point");
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        let points = self.points.read().await;
        Ok(points
            .iter()
            .map(|(subscription, point)| (subscription.clone(), point.bookmark.clone()))
            .collect())
    }

    async fn purge(&self, subscription: &str) -> StoreResult<()> {
        let mut points = self.points.write().await;
        if points.remove(subscription).is_some() {
            self.write_snapshot(&points).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_means_start_from_beginning() {
        let dir = TempDir::new().unwrap();
        let adapter = FileRecoveryPointAdapter::open(dir.path().join("none.json")).await.unwrap();
        assert_eq!(adapter.load("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_value_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.json");
        {
            let adapter = FileRecoveryPointAdapter::open(&path).await.unwrap();
            adapter.save("orders", &Bookmark::from("1|10")).await.unwrap();
            adapter.save("orders", &Bookmark::from("1|11")).await.unwrap();
            adapter.save("fills", &Bookmark::from("2|3")).await.unwrap();
        }

        let adapter = FileRecoveryPointAdapter::open(&path).await.unwrap();
        assert_eq!(adapter.load("orders").await.unwrap(), Some(Bookmark::from("1|11")));
        let all = adapter.load_all().await.unwrap();
        assert_eq!(all.len(), 2);

        adapter.purge("fills").await.unwrap();
        let adapter = FileRecoveryPointAdapter::open(&path).await.unwrap();
        assert_eq!(adapter.load("fills").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_snapshot_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.json");
        std::fs::write(&path, br#"{"version": 9, "points": {}}"#).unwrap();
        let error = FileRecoveryPointAdapter::open(&path).await.unwrap_err();
        assert!(matches!(error, StoreError::IncompatibleStoreVersion { found: 9, .. }));
    }
}
