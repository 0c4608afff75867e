// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Conflating recovery point wrapper
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bookmark::Bookmark;
use crate::error::StoreResult;
use crate::recovery::RecoveryPointAdapter;

/// Buffers saves and passes only the latest bookmark per subscription to
/// the wrapped adapter.
///
/// Pending saves reach the inner adapter when `update_threshold` distinct
/// subscriptions are pending, on `flush`, or on each tick of a flusher
/// started with `spawn_flusher`. Reads see pending values first.
pub struct ConflatingRecoveryPointAdapter<A> {
    inner: A,
    pending: Mutex<BTreeMap<String, Bookmark>>,
    drain_lock: Mutex<()>,
    update_threshold: usize,
}

impl<A: RecoveryPointAdapter> ConflatingRecoveryPointAdapter<A> {
    pub fn new(inner: A, update_threshold: usize) -> Self {
        Self {
            inner,
            pending: Mutex::new(BTreeMap::new()),
            drain_lock: Mutex::new(()),
            update_threshold: update_threshold.max(1),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn update_threshold(&self) -> usize {
        self.update_threshold
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Hand everything pending to the inner adapter.
    ///
    /// Drains run one at a time. A value leaves `pending` only once the
    /// inner adapter has stored it, and only if no newer save replaced it,
    /// so reads never fall back to an older inner value mid-drain.
    async fn drain(&self) -> StoreResult<usize> {
        let _draining = self.drain_lock.lock().await;
        let batch = self.pending.lock().await.clone();
        let mut written = 0;
        for (subscription, bookmark) in batch {
            self.inner.save(&subscription, &bookmark).await?;
            let mut pending = self.pending.lock().await;
            if pending.get(&subscription) == Some(&bookmark) {
                pending.remove(&subscription);
            }
            written += 1;
        }
        Ok(written)
    }
}

impl<A: RecoveryPointAdapter + 'static> ConflatingRecoveryPointAdapter<A> {
    /// Flush on a fixed interval until the adapter is dropped.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(adapter) = weak.upgrade() else {
                    break;
                };
                if let Err(error) = adapter.flush().await {
                    warn!(error = %error, adapter = adapter.inner.name(), "Recovery point flush failed");
                }
            }
        })
    }
}

#[async_trait]
impl<A: RecoveryPointAdapter> RecoveryPointAdapter for ConflatingRecoveryPointAdapter<A> {
    async fn load(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        if let Some(bookmark) = self.pending.lock().await.get(subscription) {
            return Ok(Some(bookmark.clone()));
        }
        self.inner.load(subscription).await
    }

    async fn save(&self, subscription: &str, bookmark: &Bookmark) -> StoreResult<()> {
        let pending = {
            let mut pending = self.pending.lock().await;
            pending.insert(subscription.to_string(), bookmark.clone());
            pending.len()
        };
        if pending >= self.update_threshold {
            self.drain().await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        let mut all = self.inner.load_all().await?;
        let pending = self.pending.lock().await;
        for (subscription, bookmark) in pending.iter() {
            all.insert(subscription.clone(), bookmark.clone());
        }
        Ok(all)
    }

    async fn purge(&self, subscription: &str) -> StoreResult<()> {
        let _draining = self.drain_lock.lock().await;
        self.pending.lock().await.remove(subscription);
        self.inner.purge(subscription).await
    }

    async fn flush(&self) -> StoreResult<()> {
        let written = self.drain().await?;
        if written > 0 {
            debug!(written, adapter = self.inner.name(), "Flushed conflated recovery points");
        }
        self.inner.flush().await
    }

    fn name(&self) -> &str {
        "conflating"
    }
}
