// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use relaybus_store::StoreError;
use thiserror::Error;

/// Errors reported by the failover client and its collaborators.
#[derive(Debug, Error)]
pub enum HaError {
    /// The transport could not reach the endpoint, or an established
    /// connection failed. Retried with backoff.
    #[error("connection to {uri} failed: {reason}")]
    ConnectionFailure { uri: String, reason: String },

    /// The server refused the logon, or the retry bound was reached.
    #[error("authentication with {uri} failed: {reason}")]
    AuthenticationFailure { uri: String, reason: String },

    /// Every endpoint has been removed from the chooser.
    #[error("no servers available: {0}")]
    NoServersAvailable(String),

    /// At least one tracked subscription could not be reissued after a
    /// reconnect. The connection itself stays up.
    #[error("{} subscription(s) failed to resubscribe: {}", .failed.len(), .failed.join(", "))]
    PartialResubscribeFailure { failed: Vec<String> },

    /// The connect loop or the delay strategy gave up.
    #[error("retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// The client has been closed.
    #[error("client closed")]
    Closed,

    /// A transport-specific failure on an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// A server URI that does not parse.
    #[error("invalid server uri {uri:?}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    /// The client configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A store failure. Capacity and corruption errors always surface here.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HaError {
    /// Returns `true` for failures the connect loop handles by moving on to
    /// the next attempt rather than returning to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HaError::ConnectionFailure { .. }
                | HaError::AuthenticationFailure { .. }
                | HaError::Transport(_)
        )
    }
}

/// Convenience type alias for client results.
pub type HaResult<T> = Result<T, HaError>;
