// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Lifecycle notifications
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HaError;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Resubscribing,
    Replaying,
    Connected,
    Disconnecting,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Resubscribing => "resubscribing",
            ConnectionState::Replaying => "replaying",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Receives client lifecycle events. Every method defaults to doing
/// nothing.
///
/// Called synchronously on the task that caused the event; implementations
/// must not block.
pub trait ClientObserver: Send + Sync {
    fn on_state_change(&self, _state: ConnectionState, _at: DateTime<Utc>) {}

    /// A failure the retry loop absorbed.
    fn on_exception(&self, _error: &HaError) {}

    fn on_failed_resubscribe(&self, _subscription_id: &str, _error: &HaError) {}

    /// The transport rejected a live or replayed publish. The record stays
    /// in the publish store.
    fn on_failed_write(&self, _sequence: u64, _error: &HaError) {}
}

/// Observers in registration order.
#[derive(Default, Clone)]
pub struct ObserverList {
    observers: Vec<Arc<dyn ClientObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn ClientObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn state_changed(&self, state: ConnectionState) {
        let at = Utc::now();
        for observer in &self.observers {
            observer.on_state_change(state, at);
        }
    }

    pub fn exception(&self, error: &HaError) {
        for observer in &self.observers {
            observer.on_exception(error);
        }
    }

    pub fn failed_resubscribe(&self, subscription_id: &str, error: &HaError) {
        for observer in &self.observers {
            observer.on_failed_resubscribe(subscription_id, error);
        }
    }

    pub fn failed_write(&self, sequence: u64, error: &HaError) {
        for observer in &self.observers {
            observer.on_failed_write(sequence, error);
        }
    }
}
