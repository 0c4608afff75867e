// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Server-of-record recovery points
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The server already tracks what each subscriber acknowledged, so this
// adapter keeps nothing locally. Reads go to the server; writes are
// forwarded only when the source asks for them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bookmark::Bookmark;
use crate::error::StoreResult;
use crate::recovery::RecoveryPointAdapter;

/// Where the server-of-record adapter gets its answers.
///
/// Implemented by the client's connection layer; `MemoryRecoveryPointSource`
/// stands in for a server in tests.
#[async_trait]
pub trait RecoveryPointSource: Send + Sync {
    async fn fetch(&self, subscription: &str) -> StoreResult<Option<Bookmark>>;

    async fn fetch_all(&self) -> StoreResult<BTreeMap<String, Bookmark>>;

    /// Servers that learn recovery points from acks ignore this.
    async fn record(&self, _subscription: &str, _bookmark: &Bookmark) -> StoreResult<()> {
        Ok(())
    }

    async fn forget(&self, _subscription: &str) -> StoreResult<()> {
        Ok(())
    }
}

/// Recovery points held by the server.
pub struct ServerRecoveryPointAdapter<S: ?Sized> {
    source: Arc<S>,
}

impl<S: RecoveryPointSource + ?Sized> ServerRecoveryPointAdapter<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }
}

#[async_trait]
impl<S: RecoveryPointSource + ?Sized + 'static> RecoveryPointAdapter for ServerRecoveryPointAdapter<S> {
    async fn load(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        let point = self.source.fetch(subscription).await?;
        debug!(subscription, found = point.is_some(), "Fetched recovery point from server");
        Ok(point)
    }

    async fn save(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        self.source.record(subscription, bookmark).await
    }

    async fn load_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        self.source.fetch_all().await
    }

    async fn purge(&self, subscription: &str) -> StoreResult<()> {
        self.source.forget(subscription).await
    }

    fn name(&self) -> &str {
        "server"
    }
}

/// A source answering from a map.
#[derive(Debug, Default)]
pub struct MemoryRecoveryPointSource {
    points: RwLock<BTreeMap<String, Bookmark>>,
}

impl MemoryRecoveryPointSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, subscription: &str, bookmark: Bookmark) {
        self.points.write().await.insert(subscription.to_string(), bookmark);
    }
}

#[async_trait]
impl RecoveryPointSource for MemoryRecoveryPointSource {
    async fn fetch(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        Ok(self.points.read().await.get(subscription).cloned())
    }

    async fn fetch_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        Ok(self.points.read().await.clone())
    }

    async fn record(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        self.set(subscription, bookmark.clone()).await;
        Ok(())
    }

    async fn forget(&self, subscription: &str) -> StoreResult<()> {
        self.points.write().await.remove(subscription);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AckDrivenSource;

    #[async_trait]
    impl RecoveryPointSource for AckDrivenSource {
        async fn fetch(&self, _subscription: &str) -> StoreResult<Option<Bookmark>> {
            Ok(Some(Bookmark::from("server|42")))
        }

        async fn fetch_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test]
    async fn test_reads_come_from_server() {
        let source = Arc::new(MemoryRecoveryPointSource::new());
        source.set("orders", Bookmark::from("7|1")).await;
        let adapter = ServerRecoveryPointAdapter::new(Arc::clone(&source));

        assert_eq!(adapter.load("orders").await.unwrap(), Some(Bookmark::from("7|1")));
        assert_eq!(adapter.load("fills").await.unwrap(), None);

        adapter.save("fills", &Bookmark::from("7|2")).await.unwrap();
        assert_eq!(adapter.load_all().await.unwrap().len(), 2);
        adapter.purge("orders").await.unwrap();
        assert_eq!(adapter.load("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_saves_ignored_by_ack_driven_server() {
        let adapter = ServerRecoveryPointAdapter::new(Arc::new(AckDrivenSource));
        adapter.save("orders", &Bookmark::from("local|1")).await.unwrap();
        assert_eq!(adapter.load("orders").await.unwrap(), Some(Bookmark::from("server|42")));
    }
}
