// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Transport boundary
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The client never touches sockets or wire encoding. A `Transport` opens
// connections; a `Connection` carries logon, subscription commands and
// publishes out, and hands inbound events back through `recv`.

use std::sync::Arc;

use async_trait::async_trait;
use relaybus_store::Bookmark;
use url::Url;

use crate::auth::{Credentials, LogonOutcome};
use crate::error::HaResult;
use crate::subscription::SubscribeRequest;

/// Something the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Every publish up to and including `sequence` is persisted server-side.
    PublishAck { sequence: u64 },
    Message {
        subscription_id: String,
        bookmark: Bookmark,
        payload: Vec<u8>,
    },
    /// The connection is gone. No further events follow.
    Disconnected { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection. Failures should be
    /// [`HaError::ConnectionFailure`](crate::HaError::ConnectionFailure).
    async fn connect(&self, uri: &Url) -> HaResult<Arc<dyn Connection>>;
}

/// One established connection.
///
/// `recv` is called from a single task; the other methods may be called
/// concurrently with it.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn logon(&self, credentials: &Credentials) -> HaResult<LogonOutcome>;

    /// Start (or restart) a subscription, resuming after `resume_from` when
    /// given.
    async fn subscribe(
        &self,
        request: &SubscribeRequest,
        resume_from: Option<&Bookmark>,
    ) -> HaResult<()>;

    async fn unsubscribe(&self, subscription_id: &str) -> HaResult<()>;

    async fn publish(&self, sequence: u64, payload: &[u8]) -> HaResult<()>;

    async fn recv(&self) -> HaResult<InboundEvent>;

    async fn close(&self) -> HaResult<()>;

    /// The server's recorded resume point for a subscription, for servers
    /// that keep one.
    async fn recovery_point(&self, _subscription_id: &str) -> HaResult<Option<Bookmark>> {
        Ok(None)
    }
}
