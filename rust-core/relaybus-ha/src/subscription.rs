// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Subscription tracking
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The client owns one `SubscriptionManager`. It remembers every active
// subscription request so a new connection can reissue them, and routes
// inbound messages to the `Subscription` stream handed to the caller.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::Stream;
use relaybus_store::{Bookmark, BookmarkStore, RecoveryPointAdapter};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{HaError, HaResult};
use crate::transport::Connection;

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Also the key bookmarks and recovery points are stored under.
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub filter: Option<String>,
}

impl SubscribeRequest {
    /// A request with a generated id.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            filter: None,
        }
    }

    /// Use a stable id so the subscription resumes across restarts.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// One inbound message handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subscription_id: String,
    pub bookmark: Bookmark,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// The caller's end of a subscription. Ends when the subscription is
/// removed or the client closes.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.receiver.poll_recv(cx)
    }
}

struct Tracked {
    request: SubscribeRequest,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// Active subscriptions, keyed by id.
#[derive(Default)]
pub struct SubscriptionManager {
    tracked: BTreeMap<String, Tracked>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `request`. A request reusing an id replaces the earlier one,
    /// whose stream ends.
    pub fn add(&mut self, request: SubscribeRequest) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = request.id.clone();
        if self
            .tracked
            .insert(id.clone(), Tracked { request, sender })
            .is_some()
        {
            debug!(subscription = %id, "Replaced existing subscription");
        }
        Subscription { id, receiver }
    }

    pub fn remove(&mut self, id: &str) -> Option<SubscribeRequest> {
        self.tracked.remove(id).map(|tracked| tracked.request)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracked.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// The requests to reissue, in id order.
    pub fn snapshot(&self) -> Vec<SubscribeRequest> {
        self.tracked
            .values()
            .map(|tracked| tracked.request.clone())
            .collect()
    }

    /// Route a delivery to its stream. Returns `false` when nobody is
    /// listening.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        let Some(tracked) = self.tracked.get(&delivery.subscription_id) else {
            warn!(subscription = %delivery.subscription_id, "Message for unknown subscription dropped");
            return false;
        };
        tracked.sender.send(delivery).is_ok()
    }

    /// Drop every stream.
    pub fn clear(&mut self) {
        self.tracked.clear();
    }
}

/// Where a subscription resumes: its most recently discarded bookmark,
/// else its recovery point, else the start of the stream.
pub async fn resume_point(
    subscription_id: &str,
    bookmarks: &dyn BookmarkStore,
    recovery: Option<&dyn RecoveryPointAdapter>,
) -> HaResult<Option<Bookmark>> {
    if let Some(bookmark) = bookmarks.get_most_recent(subscription_id) {
        return Ok(Some(bookmark));
    }
    match recovery {
        Some(adapter) => Ok(adapter.load(subscription_id).await?),
        None => Ok(None),
    }
}

/// Outcome of reissuing every tracked subscription on a new connection.
#[derive(Debug, Default)]
pub struct ResubscribeReport {
    pub resubscribed: Vec<String>,
    pub failed: Vec<(String, HaError)>,
}

impl ResubscribeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> HaResult<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        Err(HaError::PartialResubscribeFailure {
            failed: self.failed.into_iter().map(|(id, _)| id).collect(),
        })
    }
}

/// Reissue `requests` on `connection` concurrently. One failure does not
/// stop the others; the report lists results in request order.
pub async fn resubscribe(
    connection: &dyn Connection,
    requests: &[SubscribeRequest],
    bookmarks: &dyn BookmarkStore,
    recovery: Option<&dyn RecoveryPointAdapter>,
) -> ResubscribeReport {
    let attempts = requests.iter().map(|request| async move {
        let resume = resume_point(&request.id, bookmarks, recovery).await?;
        debug!(subscription = %request.id, resume = ?resume.as_ref().map(Bookmark::as_str), "Resubscribing");
        connection.subscribe(request, resume.as_ref()).await
    });
    let results = join_all(attempts).await;

    let mut report = ResubscribeReport::default();
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(()) => report.resubscribed.push(request.id.clone()),
            Err(error) => report.failed.push((request.id.clone(), error)),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relaybus_store::bookmark::MemoryBookmarkStore;

    fn delivery(id: &str, bookmark: &str) -> Delivery {
        Delivery {
            subscription_id: id.to_string(),
            bookmark: Bookmark::from(bookmark),
            payload: b"body".to_vec(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_to_stream() {
        let mut manager = SubscriptionManager::new();
        let mut orders = manager.add(SubscribeRequest::new("orders").with_id("orders"));
        assert!(manager.deliver(delivery("orders", "1|1")));
        assert!(!manager.deliver(delivery("fills", "1|1")));

        let received = orders.next().await.unwrap();
        assert_eq!(received.bookmark, Bookmark::from("1|1"));
    }

    #[tokio::test]
    async fn test_remove_ends_stream() {
        let mut manager = SubscriptionManager::new();
        let mut orders = manager.add(SubscribeRequest::new("orders").with_id("orders"));
        assert_eq!(manager.remove("orders").unwrap().topic, "orders");
        assert!(orders.recv().await.is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SubscribeRequest::new("orders");
        let b = SubscribeRequest::new("orders");
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_resume_prefers_bookmark_store() {
        let bookmarks = MemoryBookmarkStore::new();
        let handle = bookmarks.log("orders", &Bookmark::from("5|2")).unwrap();
        bookmarks.discard(&handle).unwrap();

        let resume = resume_point("orders", &bookmarks, None).await.unwrap();
        assert_eq!(resume, Some(Bookmark::from("5|2")));
        assert_eq!(resume_point("fills", &bookmarks, None).await.unwrap(), None);
    }

    #[test]
    fn test_partial_report_into_error() {
        let report = ResubscribeReport {
            resubscribed: vec!["a".into()],
            failed: vec![("b".into(), HaError::NotConnected)],
        };
        assert!(!report.is_complete());
        assert!(matches!(
            report.into_result(),
            Err(HaError::PartialResubscribeFailure { failed }) if failed == vec!["b".to_string()]
        ));
    }
}
