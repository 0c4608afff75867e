// SPDX-License-Identifier: PMPL-1.0-or-later
//! End-to-end orchestration tests against an in-process transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaybus_ha::{
    ChooserPolicy, ClientConfig, ClientObserver, Connection, ConnectionState, Credentials,
    DefaultServerChooser, FixedDelayStrategy, HaClient, HaError, HaResult, InboundEvent,
    LogonOutcome, SubscribeRequest, Transport,
};
use relaybus_store::recovery::{MemoryRecoveryPointSource, ServerRecoveryPointAdapter};
use relaybus_store::{Bookmark, RecoveryPointSource};
use tokio::sync::mpsc;
use url::Url;

// ===========================================================================
// Mock transport
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Logon(String),
    Subscribe(String, Option<String>),
    Unsubscribe(String),
    Publish(u64, Vec<u8>),
    Close,
}

/// A call the mock server never answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Subscribe,
    Publish,
}

#[derive(Default)]
struct ServerBehaviour {
    refuse: bool,
    stall: Option<Stall>,
    logon: VecDeque<LogonOutcome>,
    reject_subscriptions: HashSet<String>,
    recovery_points: HashMap<String, String>,
}

struct MockConnection {
    host: String,
    stall: Option<Stall>,
    logon: Mutex<VecDeque<LogonOutcome>>,
    reject_subscriptions: HashSet<String>,
    recovery_points: HashMap<String, String>,
    sent: Mutex<Vec<Sent>>,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
}

impl MockConnection {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn published(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Publish(sequence, _) => Some(sequence),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: InboundEvent) {
        self.events_tx.send(event).unwrap();
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn logon(&self, credentials: &Credentials) -> HaResult<LogonOutcome> {
        self.record(Sent::Logon(credentials.user.clone()));
        Ok(self.logon.lock().unwrap().pop_front().unwrap_or(LogonOutcome::Accepted))
    }

    async fn subscribe(&self, request: &SubscribeRequest, resume_from: Option<&Bookmark>) -> HaResult<()> {
        if self.stall == Some(Stall::Subscribe) {
            std::future::pending::<()>().await;
        }
        if self.reject_subscriptions.contains(&request.id) {
            return Err(HaError::Transport(format!("{} rejected {}", self.host, request.id)));
        }
        self.record(Sent::Subscribe(
            request.id.clone(),
            resume_from.map(|bookmark| bookmark.to_string()),
        ));
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> HaResult<()> {
        self.record(Sent::Unsubscribe(subscription_id.to_string()));
        Ok(())
    }

    async fn publish(&self, sequence: u64, payload: &[u8]) -> HaResult<()> {
        if self.stall == Some(Stall::Publish) {
            std::future::pending::<()>().await;
        }
        self.record(Sent::Publish(sequence, payload.to_vec()));
        Ok(())
    }

    async fn recv(&self) -> HaResult<InboundEvent> {
        let mut events = self.events_rx.lock().await;
        Ok(events.recv().await.unwrap_or(InboundEvent::Disconnected {
            reason: "channel closed".to_string(),
        }))
    }

    async fn close(&self) -> HaResult<()> {
        self.record(Sent::Close);
        Ok(())
    }

    async fn recovery_point(&self, subscription_id: &str) -> HaResult<Option<Bookmark>> {
        Ok(self.recovery_points.get(subscription_id).map(|value| Bookmark::from(value.as_str())))
    }
}

#[derive(Default)]
struct MockTransport {
    behaviour: Mutex<HashMap<String, ServerBehaviour>>,
    attempts: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    fn configure(&self, host: &str, configure: impl FnOnce(&mut ServerBehaviour)) {
        configure(self.behaviour.lock().unwrap().entry(host.to_string()).or_default());
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index])
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, uri: &Url) -> HaResult<Arc<dyn Connection>> {
        let host = uri.host_str().unwrap_or_default().to_string();
        self.attempts.lock().unwrap().push(host.clone());

        let mut behaviour = self.behaviour.lock().unwrap();
        let server = behaviour.entry(host.clone()).or_default();
        if server.refuse {
            return Err(HaError::ConnectionFailure {
                uri: uri.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection {
            host,
            stall: server.stall,
            logon: Mutex::new(std::mem::take(&mut server.logon)),
            reject_subscriptions: server.reject_subscriptions.clone(),
            recovery_points: server.recovery_points.clone(),
            sent: Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

// ===========================================================================
// Observer
// ===========================================================================

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<ConnectionState>>,
    exceptions: Mutex<Vec<String>>,
    failed_resubscribes: Mutex<Vec<String>>,
}

impl ClientObserver for Recorder {
    fn on_state_change(&self, state: ConnectionState, _at: DateTime<Utc>) {
        self.states.lock().unwrap().push(state);
    }

    fn on_exception(&self, error: &HaError) {
        self.exceptions.lock().unwrap().push(error.to_string());
    }

    fn on_failed_resubscribe(&self, subscription_id: &str, _error: &HaError) {
        self.failed_resubscribes.lock().unwrap().push(subscription_id.to_string());
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

/// Route client logs to the test harness; `RUST_LOG=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn servers(hosts: &[&str]) -> DefaultServerChooser {
    let uris: Vec<String> = hosts.iter().map(|host| format!("tcp://{host}:9007")).collect();
    DefaultServerChooser::with_servers(ChooserPolicy::RoundRobin, uris).unwrap()
}

fn client(transport: &Arc<MockTransport>, hosts: &[&str], recorder: &Arc<Recorder>) -> HaClient {
    init_tracing();
    HaClient::builder(Arc::clone(transport) as Arc<dyn Transport>)
        .chooser(servers(hosts))
        .delay(FixedDelayStrategy::new(Duration::from_millis(10)))
        .observer(Arc::clone(recorder) as Arc<dyn ClientObserver>)
        .build()
        .unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_fails_over_to_next_server() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| server.refuse = true);
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a", "b"], &recorder);

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.attempts(), vec!["a", "b"]);
    assert_eq!(recorder.exceptions.lock().unwrap().len(), 1);
    let states = recorder.states.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Resubscribing,
            ConnectionState::Replaying,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_logon_retry_within_limit_succeeds() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| {
        server.logon = VecDeque::from([LogonOutcome::Retry, LogonOutcome::Retry]);
    });
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a"], &recorder);

    client.connect().await.unwrap();

    let logons = transport
        .connection(0)
        .sent()
        .into_iter()
        .filter(|sent| matches!(sent, Sent::Logon(_)))
        .count();
    assert_eq!(logons, 3);
}

#[tokio::test(start_paused = true)]
async fn test_logon_retry_beyond_limit_fails_attempt() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| {
        server.logon = VecDeque::from(vec![LogonOutcome::Retry; 5]);
    });
    let recorder = Arc::new(Recorder::default());
    let client = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>)
        .chooser(servers(&["a"]))
        .delay(FixedDelayStrategy::new(Duration::from_millis(10)))
        .observer(Arc::clone(&recorder) as Arc<dyn ClientObserver>)
        .logon_retry_limit(2)
        .max_connect_attempts(Some(1))
        .build()
        .unwrap();

    let error = client.connect().await.unwrap_err();
    assert!(matches!(error, HaError::RetriesExhausted { attempts: 1 }));
    assert!(recorder.exceptions.lock().unwrap()[0].contains("logon retry limit"));
    assert_eq!(transport.connection(0).sent().last(), Some(&Sent::Close));
}

#[tokio::test(start_paused = true)]
async fn test_partial_resubscribe_keeps_connection() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| {
        server.reject_subscriptions.insert("fills".to_string());
    });
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a"], &recorder);
    let _orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await.unwrap();
    let _fills = client.subscribe(SubscribeRequest::new("fills").with_id("fills")).await.unwrap();

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(*recorder.failed_resubscribes.lock().unwrap(), vec!["fills".to_string()]);
    assert!(transport
        .connection(0)
        .sent()
        .contains(&Sent::Subscribe("orders".to_string(), None)));
}

#[tokio::test(start_paused = true)]
async fn test_replay_after_reconnect_in_sequence_order() {
    let transport = Arc::new(MockTransport::default());
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a", "b"], &recorder);

    for payload in [&b"m1"[..], b"m2", b"m3"] {
        client.publish(payload).await.unwrap();
    }
    let supervisor = client.spawn();
    eventually(|| client.state() == ConnectionState::Connected).await;

    let first = transport.connection(0);
    assert_eq!(first.published(), vec![1, 2, 3]);

    first.push(InboundEvent::PublishAck { sequence: 2 });
    eventually(|| client.publish_store().unpersisted_count() == 1).await;
    assert_eq!(client.publish(b"m4").await.unwrap(), 4);
    assert_eq!(first.published(), vec![1, 2, 3, 4]);

    first.push(InboundEvent::Disconnected {
        reason: "server restart".to_string(),
    });
    eventually(|| transport.connection_count() == 2 && client.state() == ConnectionState::Connected).await;

    assert_eq!(transport.connection(1).published(), vec![3, 4]);
    assert!(first.sent().contains(&Sent::Close));

    client.close().await.unwrap();
    assert!(supervisor.await.unwrap().is_ok());
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_during_backoff_aborts_connect() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| server.refuse = true);
    let client = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>)
        .chooser(servers(&["a"]))
        .delay(FixedDelayStrategy::new(Duration::from_secs(60)))
        .build()
        .unwrap();
    client.publish(b"pending").await.unwrap();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    eventually(|| !transport.attempts().is_empty()).await;

    client.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), connecting)
        .await
        .expect("connect did not abort")
        .unwrap();

    assert!(matches!(result, Err(HaError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.publish_store().unpersisted_count(), 1);
    assert!(matches!(client.publish(b"late").await, Err(HaError::Closed)));
}

#[tokio::test]
async fn test_publish_flush_waits_for_acks() {
    let transport = Arc::new(MockTransport::default());
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a"], &recorder);
    assert!(matches!(
        client.publish_flush(Duration::from_millis(10)).await,
        Err(HaError::NotConnected)
    ));

    let supervisor = client.spawn();
    eventually(|| client.state() == ConnectionState::Connected).await;
    client.publish(b"m1").await.unwrap();
    client.publish(b"m2").await.unwrap();

    let flushing = tokio::spawn({
        let client = client.clone();
        async move { client.publish_flush(Duration::from_secs(5)).await }
    });
    transport.connection(0).push(InboundEvent::PublishAck { sequence: 2 });
    flushing.await.unwrap().unwrap();
    assert_eq!(client.publish_store().unpersisted_count(), 0);

    client.close().await.unwrap();
    assert!(supervisor.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_dropped_and_recovery_point_saved() {
    let transport = Arc::new(MockTransport::default());
    let source = Arc::new(MemoryRecoveryPointSource::new());
    let client = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>)
        .chooser(servers(&["a"]))
        .recovery_points(Arc::new(ServerRecoveryPointAdapter::new(Arc::clone(&source))))
        .build()
        .unwrap();
    let mut orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await.unwrap();
    client.connect().await.unwrap();

    let message = |bookmark: &str| InboundEvent::Message {
        subscription_id: "orders".to_string(),
        bookmark: Bookmark::from(bookmark),
        payload: bookmark.as_bytes().to_vec(),
    };
    client.process_event(message("1|1")).await.unwrap();
    let first = orders.recv().await.unwrap();
    client.discard(&first).await.unwrap();

    client.process_event(message("1|1")).await.unwrap();
    client.process_event(message("1|2")).await.unwrap();
    assert_eq!(orders.recv().await.unwrap().bookmark, Bookmark::from("1|2"));
    assert_eq!(source.fetch("orders").await.unwrap(), Some(Bookmark::from("1|1")));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_resumes_from_server_recovery_point() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| {
        server.recovery_points.insert("orders".to_string(), "srv|9".to_string());
    });
    let builder = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>);
    let source = builder.recovery_point_source();
    let client = builder
        .chooser(servers(&["a"]))
        .recovery_points(Arc::new(ServerRecoveryPointAdapter::new(source)))
        .build()
        .unwrap();
    let _orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await.unwrap();

    client.connect().await.unwrap();

    assert!(transport
        .connection(0)
        .sent()
        .contains(&Sent::Subscribe("orders".to_string(), Some("srv|9".to_string()))));
}

#[tokio::test(start_paused = true)]
async fn test_connection_source_fetches_tracked_recovery_points() {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| {
        server.recovery_points.insert("orders".to_string(), "srv|9".to_string());
        server.recovery_points.insert("untracked".to_string(), "srv|1".to_string());
    });
    let builder = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>);
    let source = builder.recovery_point_source();
    let client = builder.chooser(servers(&["a"])).build().unwrap();
    let _orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await.unwrap();
    let _quotes = client.subscribe(SubscribeRequest::new("quotes").with_id("quotes")).await.unwrap();

    assert!(source.fetch_all().await.unwrap().is_empty());

    client.connect().await.unwrap();
    let points = source.fetch_all().await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points.get("orders"), Some(&Bookmark::from("srv|9")));
}

#[tokio::test(start_paused = true)]
async fn test_untracked_delivery_leaves_bookmark_store_alone() {
    let transport = Arc::new(MockTransport::default());
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a"], &recorder);
    client.connect().await.unwrap();

    client
        .process_event(InboundEvent::Message {
            subscription_id: "ghost".to_string(),
            bookmark: Bookmark::from("1|1"),
            payload: b"body".to_vec(),
        })
        .await
        .unwrap();

    assert!(client.bookmark_store().subscriptions().is_empty());
    assert_eq!(client.bookmark_store().oldest_unprocessed("ghost"), None);
}

/// Close while the mock server holds a call open mid-sequence; nothing in
/// the stores may move.
async fn close_mid_sequence(stall: Stall, stalled_in: ConnectionState) {
    let transport = Arc::new(MockTransport::default());
    transport.configure("a", |server| server.stall = Some(stall));
    let recorder = Arc::new(Recorder::default());
    let client = client(&transport, &["a"], &recorder);

    client.publish(b"m1").await.unwrap();
    client.publish(b"m2").await.unwrap();
    let bookmarks = client.bookmark_store();
    bookmarks.log("orders", &Bookmark::from("1|1")).unwrap();
    bookmarks.log("orders", &Bookmark::from("1|2")).unwrap();
    bookmarks.discard_bookmark("orders", &Bookmark::from("1|1")).unwrap();
    let _orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await.unwrap();

    let unpersisted = client.publish_store().unpersisted_count();
    let most_recent = bookmarks.get_most_recent("orders");
    let oldest = bookmarks.oldest_unprocessed("orders");

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    eventually(|| client.state() == stalled_in).await;

    client.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), connecting)
        .await
        .expect("connect did not abort")
        .unwrap();

    assert!(matches!(result, Err(HaError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.publish_store().unpersisted_count(), unpersisted);
    assert_eq!(unpersisted, 2);
    assert_eq!(bookmarks.get_most_recent("orders"), most_recent);
    assert_eq!(most_recent, Some(Bookmark::from("1|1")));
    assert_eq!(bookmarks.oldest_unprocessed("orders"), oldest);
    assert_eq!(oldest, Some(Bookmark::from("1|2")));
    assert!(transport.connection(0).sent().contains(&Sent::Close));
}

#[tokio::test(start_paused = true)]
async fn test_close_during_resubscribe_leaves_stores_unchanged() {
    close_mid_sequence(Stall::Subscribe, ConnectionState::Resubscribing).await;
}

#[tokio::test(start_paused = true)]
async fn test_close_during_replay_leaves_stores_unchanged() {
    close_mid_sequence(Stall::Publish, ConnectionState::Replaying).await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_servers_give_no_servers_available() {
    let transport = Arc::new(MockTransport::default());
    let mut chooser = servers(&["a"]);
    relaybus_ha::ServerChooser::remove(&mut chooser, "tcp://a:9007");
    let client = HaClient::builder(Arc::clone(&transport) as Arc<dyn Transport>)
        .chooser(chooser)
        .build()
        .unwrap();

    assert!(matches!(client.connect().await, Err(HaError::NoServersAvailable(_))));
    assert!(transport.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_config_replays_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = ClientConfig::from_json_str(
        &serde_json::json!({
            "servers": ["tcp://a:9007"],
            "delay": { "kind": "fixed", "delay_ms": 10 },
            "publish_store": { "kind": "persistent", "path": dir.path().join("publish.blk") },
            "bookmark_store": { "kind": "logged", "path": dir.path().join("bookmarks.log") },
            "recovery_point": { "kind": "local", "path": dir.path().join("recovery.json") }
        })
        .to_string(),
    )
    .unwrap();

    {
        let transport = Arc::new(MockTransport::default());
        let client = HaClient::from_config(&config, transport as Arc<dyn Transport>).await.unwrap();
        client.publish(b"before restart").await.unwrap();
        client.close().await.unwrap();
    }

    let transport = Arc::new(MockTransport::default());
    let client = HaClient::from_config(&config, Arc::clone(&transport) as Arc<dyn Transport>)
        .await
        .unwrap();
    assert_eq!(client.publish_store().unpersisted_count(), 1);
    client.connect().await.unwrap();
    assert_eq!(transport.connection(0).published(), vec![1]);
}
