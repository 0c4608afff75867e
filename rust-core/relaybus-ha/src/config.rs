// SPDX-License-Identifier: PMPL-1.0-or-later
//! Client configuration.
//!
//! One serde document describes a whole client: endpoints, backoff, stores
//! and recovery points. Environment variables override the endpoint list
//! and connect bounds so a deployment can repoint a client without editing
//! its file:
//!
//! - `RELAYBUS_SERVERS`: comma-separated endpoint URIs
//! - `RELAYBUS_CHOOSER`: `round_robin` or `priority`
//! - `RELAYBUS_MAX_CONNECT_ATTEMPTS`: a positive integer, or `0` for no bound

use std::path::Path;
use std::time::Duration;

use relaybus_store::{BookmarkStoreConfig, PublishStoreConfig, RecoveryPointConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chooser::{ChooserPolicy, DefaultServerChooser, ServerChooser};
use crate::client::DEFAULT_LOGON_RETRY_LIMIT;
use crate::delay::{ExponentialDelayStrategy, FixedDelayStrategy, ReconnectDelayStrategy};
use crate::error::{HaError, HaResult};

pub const ENV_SERVERS: &str = "RELAYBUS_SERVERS";
pub const ENV_CHOOSER: &str = "RELAYBUS_CHOOSER";
pub const ENV_MAX_CONNECT_ATTEMPTS: &str = "RELAYBUS_MAX_CONNECT_ATTEMPTS";

/// Reconnect backoff, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayConfig {
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        max_retry_time_ms: Option<u64>,
    },
    Exponential {
        #[serde(default = "default_base_ms")]
        base_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default)]
        jitter_ms: u64,
        #[serde(default)]
        max_retry_time_ms: Option<u64>,
    },
}

fn default_base_ms() -> u64 {
    200
}

fn default_max_ms() -> u64 {
    20_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for DelayConfig {
    fn default() -> Self {
        DelayConfig::Exponential {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter_ms: 0,
            max_retry_time_ms: None,
        }
    }
}

/// Everything needed to build an [`HaClient`](crate::HaClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Label used in logs.
    pub name: String,
    /// Endpoint URIs in priority order.
    pub servers: Vec<String>,
    pub chooser: ChooserPolicy,
    pub delay: DelayConfig,
    pub publish_store: PublishStoreConfig,
    pub bookmark_store: BookmarkStoreConfig,
    pub recovery_point: RecoveryPointConfig,
    /// Logon retries allowed per connection.
    pub logon_retry_limit: u32,
    /// Give up connecting after this many attempts. `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "relaybus".to_string(),
            servers: Vec::new(),
            chooser: ChooserPolicy::default(),
            delay: DelayConfig::default(),
            publish_store: PublishStoreConfig::default(),
            bookmark_store: BookmarkStoreConfig::default(),
            recovery_point: RecoveryPointConfig::default(),
            logon_retry_limit: DEFAULT_LOGON_RETRY_LIMIT,
            max_connect_attempts: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> HaResult<Self> {
        serde_json::from_str(json).map_err(|e| HaError::Config(format!("invalid client config: {e}")))
    }

    /// Read a JSON file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> HaResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| HaError::Config(format!("reading {}: {e}", path.display())))?;
        let mut config = Self::from_json_str(&json)?;
        config.apply_env_overrides();
        info!(path = %path.display(), servers = config.servers.len(), "Loaded client config");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps a variable name to its
    /// value. Unparseable values are logged and ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_SERVERS).filter(|value| !value.trim().is_empty()) {
            self.servers = value
                .split(',')
                .map(str::trim)
                .filter(|uri| !uri.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = lookup(ENV_CHOOSER) {
            match value.trim() {
                "round_robin" => self.chooser = ChooserPolicy::RoundRobin,
                "priority" => self.chooser = ChooserPolicy::Priority,
                other => warn!(value = %other, "Invalid {ENV_CHOOSER} (expected round_robin or priority)"),
            }
        }

        if let Some(value) = lookup(ENV_MAX_CONNECT_ATTEMPTS) {
            match value.trim().parse::<u32>() {
                Ok(0) => self.max_connect_attempts = None,
                Ok(attempts) => self.max_connect_attempts = Some(attempts),
                Err(_) => warn!(value = %value, "Invalid {ENV_MAX_CONNECT_ATTEMPTS} (expected an integer)"),
            }
        }
    }

    pub fn build_chooser(&self) -> HaResult<Box<dyn ServerChooser>> {
        if self.servers.is_empty() {
            return Err(HaError::Config("no servers configured".to_string()));
        }
        let chooser = DefaultServerChooser::with_servers(self.chooser, &self.servers)?;
        Ok(Box::new(chooser))
    }

    pub fn build_delay(&self) -> Box<dyn ReconnectDelayStrategy> {
        match &self.delay {
            DelayConfig::Fixed {
                delay_ms,
                max_retry_time_ms,
            } => {
                let strategy = FixedDelayStrategy::new(Duration::from_millis(*delay_ms));
                match max_retry_time_ms {
                    Some(limit) => Box::new(strategy.with_max_retry_time(Duration::from_millis(*limit))),
                    None => Box::new(strategy),
                }
            }
            DelayConfig::Exponential {
                base_ms,
                max_ms,
                multiplier,
                jitter_ms,
                max_retry_time_ms,
            } => {
                let mut strategy = ExponentialDelayStrategy::new(
                    Duration::from_millis(*base_ms),
                    *multiplier,
                    Duration::from_millis(*max_ms),
                )
                .with_jitter(Duration::from_millis(*jitter_ms));
                if let Some(limit) = max_retry_time_ms {
                    strategy = strategy.with_max_retry_time(Duration::from_millis(*limit));
                }
                Box::new(strategy)
            }
        }
    }
}
