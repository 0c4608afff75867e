// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Connection orchestration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `HaClient` drives one logical connection through
//
//   Disconnected -> Connecting -> Authenticating -> Resubscribing
//     -> Replaying -> Connected -> Disconnecting -> Disconnected
//
// with `Closed` reachable from anywhere. Publishes are stored before they
// are sent, so anything the server has not acknowledged is replayed on the
// next connection. The send gate is held from the moment a connection is
// installed until replay finishes, which keeps live publishes behind the
// replayed ones.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relaybus_store::bookmark::MemoryBookmarkStore;
use relaybus_store::publish::{CollectingReplayer, MemoryPublishStore};
use relaybus_store::{
    Bookmark, BookmarkStore, PublishStore, RecoveryPointAdapter, RecoveryPointSource, StoreError,
    StoreResult,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{Authenticator, DefaultAuthenticator, LogonOutcome};
use crate::chooser::ServerChooser;
use crate::config::ClientConfig;
use crate::delay::{ExponentialDelayStrategy, ReconnectDelayStrategy};
use crate::error::{HaError, HaResult};
use crate::observer::{ClientObserver, ConnectionState, ObserverList};
use crate::subscription::{
    resubscribe, resume_point, Delivery, ResubscribeReport, SubscribeRequest, Subscription,
    SubscriptionManager,
};
use crate::transport::{Connection, InboundEvent, Transport};

/// Default bound on logon retries per connection.
pub const DEFAULT_LOGON_RETRY_LIMIT: u32 = 3;

/// The connection in use and the endpoint it reaches.
#[derive(Clone)]
struct Active {
    uri: Url,
    connection: Arc<dyn Connection>,
}

type ConnectionSlot = Arc<RwLock<Option<Active>>>;

/// Answers server-of-record recovery point queries over whichever
/// connection the client currently holds. Without a connection the server
/// has nothing to say and every query comes back empty.
pub struct ConnectionRecoveryPointSource {
    slot: ConnectionSlot,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
}

impl ConnectionRecoveryPointSource {
    async fn query(connection: &dyn Connection, subscription: &str) -> StoreResult<Option<Bookmark>> {
        connection
            .recovery_point(subscription)
            .await
            .map_err(|e| StoreError::Backend(format!("recovery point query: {e}")))
    }
}

#[async_trait]
impl RecoveryPointSource for ConnectionRecoveryPointSource {
    async fn fetch(&self, subscription: &str) -> StoreResult<Option<Bookmark>> {
        let active = self.slot.read().await.clone();
        match active {
            Some(active) => Self::query(active.connection.as_ref(), subscription).await,
            None => Ok(None),
        }
    }

    /// Recovery points for every subscription the client tracks.
    async fn fetch_all(&self) -> StoreResult<BTreeMap<String, Bookmark>> {
        let active = self.slot.read().await.clone();
        let Some(active) = active else {
            return Ok(BTreeMap::new());
        };
        let requests = self.subscriptions.lock().await.snapshot();
        let mut points = BTreeMap::new();
        for request in requests {
            if let Some(bookmark) = Self::query(active.connection.as_ref(), &request.id).await? {
                points.insert(request.id, bookmark);
            }
        }
        Ok(points)
    }
}

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    chooser: Mutex<Box<dyn ServerChooser>>,
    delay: Mutex<Box<dyn ReconnectDelayStrategy>>,
    publish_store: Arc<dyn PublishStore>,
    bookmark_store: Arc<dyn BookmarkStore>,
    recovery: Option<Arc<dyn RecoveryPointAdapter>>,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
    observers: ObserverList,
    slot: ConnectionSlot,
    send_gate: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<bool>,
    logon_retry_limit: u32,
    max_connect_attempts: Option<u32>,
}

/// A failover-capable client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct HaClient {
    inner: Arc<Inner>,
}

impl HaClient {
    pub fn builder(transport: Arc<dyn Transport>) -> HaClientBuilder {
        HaClientBuilder::new(transport)
    }

    /// Build a client from configuration, opening its stores.
    pub async fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>) -> HaResult<Self> {
        let builder = Self::builder(transport);
        let recovery = config
            .recovery_point
            .open(Some(builder.recovery_point_source()))
            .await?;
        let mut builder = builder
            .name(config.name.clone())
            .chooser_boxed(config.build_chooser()?)
            .delay_boxed(config.build_delay())
            .publish_store(config.publish_store.open()?)
            .bookmark_store(config.bookmark_store.open()?)
            .logon_retry_limit(config.logon_retry_limit)
            .max_connect_attempts(config.max_connect_attempts);
        if let Some(recovery) = recovery {
            builder = builder.recovery_points(recovery);
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver that sees every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn publish_store(&self) -> &Arc<dyn PublishStore> {
        &self.inner.publish_store
    }

    pub fn bookmark_store(&self) -> &Arc<dyn BookmarkStore> {
        &self.inner.bookmark_store
    }

    /// Connect, retrying through the chooser and delay strategy until the
    /// client is `Connected`. Returns [`HaError::Closed`] if `close` is
    /// called first.
    pub async fn connect(&self) -> HaResult<()> {
        let mut closed = self.inner.closed.subscribe();
        let already_closed = *closed.borrow();
        if already_closed {
            return Err(HaError::Closed);
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(HaError::Closed),
            result = self.inner.connect_loop() => result,
        }
    }

    /// Connect and keep the connection up until `close`: pump inbound
    /// events, and reconnect after every disconnect.
    ///
    /// Returns `Ok(())` after `close`, or the error that made reconnecting
    /// impossible.
    pub async fn run(&self) -> HaResult<()> {
        let mut closed = self.inner.closed.subscribe();
        loop {
            let closing = *closed.borrow();
            if closing {
                return Ok(());
            }
            let connected = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Ok(()),
                result = self.inner.connect_loop() => result,
            };
            if let Err(error) = connected {
                self.inner.observers.exception(&error);
                return Err(error);
            }

            let active = self.inner.slot.read().await.clone();
            let Some(active) = active else {
                continue;
            };
            let pumped = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Ok(()),
                result = self.inner.pump(&active) => result,
            };
            match pumped {
                Ok(reason) => {
                    let error = HaError::ConnectionFailure {
                        uri: active.uri.to_string(),
                        reason,
                    };
                    warn!(client = %self.inner.name, error = %error, "Connection lost");
                    self.inner.observers.exception(&error);
                    self.inner.drop_connection(&active).await;
                }
                Err(error) => {
                    self.inner.observers.exception(&error);
                    self.inner.drop_connection(&active).await;
                    return Err(error);
                }
            }

            let wait = {
                let uri = self.inner.chooser.lock().await.current()?;
                self.inner.delay.lock().await.connect_wait_duration(&uri)?
            };
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Run [`run`](Self::run) on a tokio task.
    pub fn spawn(&self) -> JoinHandle<HaResult<()>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Store `payload` and send it if connected. Returns its sequence.
    ///
    /// A send the transport rejects is reported through
    /// [`ClientObserver::on_failed_write`]; the record stays stored and is
    /// replayed on the next connection.
    pub async fn publish(&self, payload: &[u8]) -> HaResult<u64> {
        self.inner.ensure_open()?;
        let _gate = self.inner.send_gate.lock().await;
        let sequence = self.inner.publish_store.store(payload)?;

        let active = self.inner.slot.read().await.clone();
        if let Some(active) = active {
            if let Err(error) = active.connection.publish(sequence, payload).await {
                warn!(client = %self.inner.name, sequence, error = %error, "Publish send failed; kept for replay");
                self.inner.observers.failed_write(sequence, &error);
            }
        }
        Ok(sequence)
    }

    /// Wait until the server has acknowledged every stored publish, or
    /// fail with [`StoreError::FlushTimeout`] after `timeout`. Acks only
    /// arrive over a connection, so this fails with
    /// [`HaError::NotConnected`] when there is none.
    pub async fn publish_flush(&self, timeout: Duration) -> HaResult<()> {
        self.inner.ensure_open()?;
        let connected = self.inner.slot.read().await.is_some();
        if !connected {
            return Err(HaError::NotConnected);
        }
        let store = Arc::clone(&self.inner.publish_store);
        tokio::task::spawn_blocking(move || store.flush(timeout))
            .await
            .map_err(|e| HaError::Transport(format!("publish flush task: {e}")))??;
        Ok(())
    }

    /// Track `request` and, when connected, subscribe now. The subscription
    /// is reissued after every reconnect until `unsubscribe`.
    pub async fn subscribe(&self, request: SubscribeRequest) -> HaResult<Subscription> {
        self.inner.ensure_open()?;
        let subscription = self.inner.subscriptions.lock().await.add(request.clone());

        let active = self.inner.slot.read().await.clone();
        if let Some(active) = active {
            let result = async {
                let resume = resume_point(
                    &request.id,
                    self.inner.bookmark_store.as_ref(),
                    self.inner.recovery.as_deref(),
                )
                .await?;
                active.connection.subscribe(&request, resume.as_ref()).await
            }
            .await;
            if let Err(error) = result {
                self.inner.subscriptions.lock().await.remove(&request.id);
                return Err(error);
            }
        }
        info!(client = %self.inner.name, subscription = %request.id, topic = %request.topic, "Subscribed");
        Ok(subscription)
    }

    /// Stop tracking a subscription. Its bookmark state is kept, so
    /// subscribing again with the same id resumes where it left off.
    pub async fn unsubscribe(&self, subscription_id: &str) -> HaResult<()> {
        if self.inner.subscriptions.lock().await.remove(subscription_id).is_none() {
            return Ok(());
        }
        let active = self.inner.slot.read().await.clone();
        if let Some(active) = active {
            active.connection.unsubscribe(subscription_id).await?;
        }
        Ok(())
    }

    /// Confirm that `delivery`, and everything before it on its
    /// subscription, has been processed.
    pub async fn discard(&self, delivery: &Delivery) -> HaResult<()> {
        let store = &self.inner.bookmark_store;
        store.discard_bookmark(&delivery.subscription_id, &delivery.bookmark)?;
        if let Some(recovery) = &self.inner.recovery {
            if let Some(most_recent) = store.get_most_recent(&delivery.subscription_id) {
                recovery.save(&delivery.subscription_id, &most_recent).await?;
            }
        }
        Ok(())
    }

    /// Apply one inbound event. [`run`](Self::run) calls this for every
    /// event it receives; it is public for callers that pump a connection
    /// themselves.
    pub async fn process_event(&self, event: InboundEvent) -> HaResult<()> {
        self.inner.process_event(event).await
    }

    /// Shut down. Accepted in any state, including while `connect` or `run`
    /// is waiting out a backoff. Buffered store state is flushed.
    pub async fn close(&self) -> HaResult<()> {
        if self.inner.closed.send_replace(true) {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Disconnecting);

        let active = self.inner.slot.write().await.take();
        if let Some(active) = active {
            if let Err(error) = active.connection.close().await {
                debug!(uri = %active.uri, error = %error, "Error closing connection");
            }
        }
        self.inner.subscriptions.lock().await.clear();

        let flushed = self.inner.flush_stores().await;
        self.inner.set_state(ConnectionState::Closed);
        info!(client = %self.inner.name, "Client closed");
        flushed
    }
}

impl Inner {
    fn ensure_open(&self) -> HaResult<()> {
        if *self.closed.borrow() {
            return Err(HaError::Closed);
        }
        Ok(())
    }

    /// Move to `state` unless already closed.
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_closed() || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(client = %self.name, %state, "State change");
            self.observers.state_changed(state);
        }
    }

    async fn connect_loop(&self) -> HaResult<()> {
        let mut attempts = 0u32;
        loop {
            let uri = self.chooser.lock().await.current()?;
            attempts = attempts.saturating_add(1);

            let error = match self.attempt(&uri).await {
                Ok(report) => {
                    self.chooser.lock().await.report_success(&uri);
                    self.delay.lock().await.reset();
                    info!(
                        client = %self.name,
                        uri = %uri,
                        resubscribed = report.resubscribed.len(),
                        failed = report.failed.len(),
                        "Connected"
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            self.set_state(ConnectionState::Disconnected);
            if !error.is_retryable() {
                return Err(error);
            }
            warn!(client = %self.name, uri = %uri, attempt = attempts, error = %error, "Connection attempt failed");
            self.observers.exception(&error);
            self.chooser.lock().await.report_failure(&uri, &error.to_string());

            if let Some(max) = self.max_connect_attempts {
                if attempts >= max {
                    return Err(HaError::RetriesExhausted { attempts });
                }
            }

            let wait = {
                let next = self.chooser.lock().await.current()?;
                self.delay.lock().await.connect_wait_duration(&next)?
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// One pass through connect, logon, resubscribe and replay.
    async fn attempt(&self, uri: &Url) -> HaResult<ResubscribeReport> {
        self.set_state(ConnectionState::Connecting);
        let connection = self.transport.connect(uri).await?;

        self.set_state(ConnectionState::Authenticating);
        if let Err(error) = self.logon(connection.as_ref(), uri).await {
            close_quietly(connection.as_ref(), uri).await;
            return Err(error);
        }

        let active = Active {
            uri: uri.clone(),
            connection,
        };
        let _gate = self.send_gate.lock().await;
        {
            let mut slot = self.slot.write().await;
            let closing = *self.closed.borrow();
            if closing {
                drop(slot);
                close_quietly(active.connection.as_ref(), uri).await;
                return Err(HaError::Closed);
            }
            *slot = Some(active.clone());
        }

        match self.resubscribe_and_replay(&active).await {
            Ok(report) => {
                self.set_state(ConnectionState::Connected);
                Ok(report)
            }
            Err(error) => {
                self.drop_connection(&active).await;
                Err(error)
            }
        }
    }

    async fn logon(&self, connection: &dyn Connection, uri: &Url) -> HaResult<()> {
        let mut credentials = self.authenticator.authenticate(uri).await?;
        let mut retries = 0u32;
        loop {
            match connection.logon(&credentials).await? {
                LogonOutcome::Accepted => return Ok(()),
                LogonOutcome::Retry if retries < self.logon_retry_limit => {
                    retries += 1;
                    debug!(uri = %uri, retry = retries, "Server asked for logon retry");
                    credentials = self.authenticator.retry(uri, retries).await?;
                }
                LogonOutcome::Retry => {
                    return Err(HaError::AuthenticationFailure {
                        uri: uri.to_string(),
                        reason: format!("logon retry limit of {} reached", self.logon_retry_limit),
                    })
                }
                LogonOutcome::Rejected(reason) => {
                    return Err(HaError::AuthenticationFailure {
                        uri: uri.to_string(),
                        reason,
                    })
                }
            }
        }
    }

    async fn resubscribe_and_replay(&self, active: &Active) -> HaResult<ResubscribeReport> {
        self.set_state(ConnectionState::Resubscribing);
        let requests = self.subscriptions.lock().await.snapshot();
        let report = resubscribe(
            active.connection.as_ref(),
            &requests,
            self.bookmark_store.as_ref(),
            self.recovery.as_deref(),
        )
        .await;
        for (subscription_id, error) in &report.failed {
            warn!(client = %self.name, subscription = %subscription_id, error = %error, "Resubscribe failed");
            self.observers.failed_resubscribe(subscription_id, error);
        }

        self.set_state(ConnectionState::Replaying);
        let mut pending = CollectingReplayer::default();
        self.publish_store.replay(&mut pending)?;
        let count = pending.records.len();
        for (sequence, payload) in pending.records {
            if let Err(error) = active.connection.publish(sequence, &payload).await {
                self.observers.failed_write(sequence, &error);
                return Err(error);
            }
        }
        if count > 0 {
            info!(client = %self.name, uri = %active.uri, replayed = count, "Replayed unacknowledged publishes");
        }
        Ok(report)
    }

    /// Read events until the connection ends. `Ok` carries the disconnect
    /// reason; `Err` is a failure that must stop the client.
    async fn pump(&self, active: &Active) -> HaResult<String> {
        loop {
            match active.connection.recv().await {
                Ok(InboundEvent::Disconnected { reason }) => return Ok(reason),
                Ok(event) => self.process_event(event).await?,
                Err(error) if error.is_retryable() => return Ok(error.to_string()),
                Err(error) => return Err(error),
            }
        }
    }

    async fn process_event(&self, event: InboundEvent) -> HaResult<()> {
        match event {
            InboundEvent::PublishAck { sequence } => {
                self.publish_store.discard_up_to(sequence)?;
                debug!(client = %self.name, sequence, "Publish acknowledged");
            }
            InboundEvent::Message {
                subscription_id,
                bookmark,
                payload,
            } => {
                if !self.subscriptions.lock().await.contains(&subscription_id) {
                    debug!(subscription = %subscription_id, bookmark = %bookmark, "Dropping delivery for untracked subscription");
                    return Ok(());
                }
                if self.bookmark_store.is_discarded(&subscription_id, &bookmark) {
                    debug!(subscription = %subscription_id, bookmark = %bookmark, "Dropping duplicate delivery");
                    return Ok(());
                }
                self.bookmark_store.log(&subscription_id, &bookmark)?;
                let delivery = Delivery {
                    subscription_id,
                    bookmark,
                    payload,
                    received_at: Utc::now(),
                };
                if !self.subscriptions.lock().await.deliver(delivery) {
                    debug!(client = %self.name, "Delivery listener has gone away");
                }
            }
            InboundEvent::Disconnected { reason } => {
                debug!(client = %self.name, reason = %reason, "Disconnect event outside the pump");
            }
        }
        Ok(())
    }

    /// Forget `active` if it is still the current connection, and close it.
    async fn drop_connection(&self, active: &Active) {
        self.set_state(ConnectionState::Disconnecting);
        {
            let mut slot = self.slot.write().await;
            let current = slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.connection, &active.connection));
            if current {
                *slot = None;
            }
        }
        close_quietly(active.connection.as_ref(), &active.uri).await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn flush_stores(&self) -> HaResult<()> {
        if let Some(recovery) = &self.recovery {
            recovery.flush().await?;
        }
        self.publish_store.sync()?;
        self.bookmark_store.persist()?;
        Ok(())
    }
}

async fn close_quietly(connection: &dyn Connection, uri: &Url) {
    if let Err(error) = connection.close().await {
        debug!(uri = %uri, error = %error, "Error closing connection");
    }
}

/// Assembles an [`HaClient`]. Only a transport and a chooser are required.
pub struct HaClientBuilder {
    name: String,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    chooser: Option<Box<dyn ServerChooser>>,
    delay: Box<dyn ReconnectDelayStrategy>,
    publish_store: Arc<dyn PublishStore>,
    bookmark_store: Arc<dyn BookmarkStore>,
    recovery: Option<Arc<dyn RecoveryPointAdapter>>,
    observers: ObserverList,
    slot: ConnectionSlot,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
    logon_retry_limit: u32,
    max_connect_attempts: Option<u32>,
}

impl HaClientBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            name: "relaybus".to_string(),
            transport,
            authenticator: Arc::new(DefaultAuthenticator),
            chooser: None,
            delay: Box::new(ExponentialDelayStrategy::default()),
            publish_store: Arc::new(MemoryPublishStore::new()),
            bookmark_store: Arc::new(MemoryBookmarkStore::new()),
            recovery: None,
            observers: ObserverList::new(),
            slot: Arc::new(RwLock::new(None)),
            subscriptions: Arc::new(Mutex::new(SubscriptionManager::new())),
            logon_retry_limit: DEFAULT_LOGON_RETRY_LIMIT,
            max_connect_attempts: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn chooser(self, chooser: impl ServerChooser + 'static) -> Self {
        self.chooser_boxed(Box::new(chooser))
    }

    pub fn chooser_boxed(mut self, chooser: Box<dyn ServerChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    pub fn delay(self, delay: impl ReconnectDelayStrategy + 'static) -> Self {
        self.delay_boxed(Box::new(delay))
    }

    pub fn delay_boxed(mut self, delay: Box<dyn ReconnectDelayStrategy>) -> Self {
        self.delay = delay;
        self
    }

    pub fn publish_store(mut self, store: Arc<dyn PublishStore>) -> Self {
        self.publish_store = store;
        self
    }

    pub fn bookmark_store(mut self, store: Arc<dyn BookmarkStore>) -> Self {
        self.bookmark_store = store;
        self
    }

    pub fn recovery_points(mut self, adapter: Arc<dyn RecoveryPointAdapter>) -> Self {
        self.recovery = Some(adapter);
        self
    }

    /// A source for server-of-record recovery points that queries the
    /// connection of the client this builder produces.
    pub fn recovery_point_source(&self) -> Arc<dyn RecoveryPointSource> {
        Arc::new(ConnectionRecoveryPointSource {
            slot: Arc::clone(&self.slot),
            subscriptions: Arc::clone(&self.subscriptions),
        })
    }

    pub fn observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn logon_retry_limit(mut self, limit: u32) -> Self {
        self.logon_retry_limit = limit;
        self
    }

    pub fn max_connect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn build(self) -> HaResult<HaClient> {
        let chooser = self
            .chooser
            .ok_or_else(|| HaError::Config("a server chooser is required".to_string()))?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (closed, _) = watch::channel(false);
        Ok(HaClient {
            inner: Arc::new(Inner {
                name: self.name,
                transport: self.transport,
                authenticator: self.authenticator,
                chooser: Mutex::new(chooser),
                delay: Mutex::new(self.delay),
                publish_store: self.publish_store,
                bookmark_store: self.bookmark_store,
                recovery: self.recovery,
                subscriptions: self.subscriptions,
                observers: self.observers,
                slot: self.slot,
                send_gate: Mutex::new(()),
                state,
                closed,
                logon_retry_limit: self.logon_retry_limit,
                max_connect_attempts: self.max_connect_attempts,
            }),
        })
    }
}
