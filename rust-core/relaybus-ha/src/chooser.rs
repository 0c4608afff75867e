// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Server selection
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The chooser keeps every configured endpoint with its failure and success
// counts. Candidates are the non-removed endpoints with the fewest
// failures; a failure makes an endpoint less preferred but never excludes
// it, only `remove` does.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{HaError, HaResult};

/// How the next endpoint is picked among the least-failed candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChooserPolicy {
    /// Rotate through the candidates starting after the current endpoint.
    #[default]
    RoundRobin,
    /// Always prefer the earliest candidate in configuration order.
    Priority,
}

/// One configured endpoint.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub uri: Url,
    pub failures: u32,
    pub successes: u32,
    pub last_failure: Option<String>,
    pub removed: bool,
}

impl ServerEntry {
    fn new(uri: Url) -> Self {
        Self {
            uri,
            failures: 0,
            successes: 0,
            last_failure: None,
            removed: false,
        }
    }
}

/// Endpoint selection with reliability tracking.
pub trait ServerChooser: Send {
    /// The endpoint to use for the next connection attempt.
    fn current(&self) -> HaResult<Url>;

    /// Advance to the next endpoint and return it.
    fn next(&mut self) -> HaResult<Url>;

    fn add(&mut self, uri: &str) -> HaResult<()>;

    /// Exclude an endpoint from selection.
    fn remove(&mut self, uri: &str);

    /// A connect or logon attempt against `uri` failed. Moves selection on.
    fn report_failure(&mut self, uri: &Url, reason: &str);

    fn report_success(&mut self, uri: &Url);

    /// Human-readable account of the most recent failure, used when no
    /// endpoint is left.
    fn error_detail(&self) -> String;
}

/// Parse a configured endpoint.
pub fn parse_uri(uri: &str) -> HaResult<Url> {
    Url::parse(uri).map_err(|source| HaError::InvalidUri {
        uri: uri.to_string(),
        source,
    })
}

/// The stock [`ServerChooser`].
#[derive(Debug, Clone, Default)]
pub struct DefaultServerChooser {
    entries: Vec<ServerEntry>,
    current: Option<usize>,
    policy: ChooserPolicy,
    last_failure: Option<(Url, String)>,
}

impl DefaultServerChooser {
    pub fn new(policy: ChooserPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Build a chooser from configured URIs, in priority order.
    pub fn with_servers<I, S>(policy: ChooserPolicy, uris: I) -> HaResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chooser = Self::new(policy);
        for uri in uris {
            chooser.add(uri.as_ref())?;
        }
        Ok(chooser)
    }

    pub fn policy(&self) -> ChooserPolicy {
        self.policy
    }

    pub fn entries(&self) -> &[ServerEntry] {
        &self.entries
    }

    pub fn entry(&self, uri: &Url) -> Option<&ServerEntry> {
        self.position(uri).map(|index| &self.entries[index])
    }

    fn position(&self, uri: &Url) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.uri == uri)
    }

    fn min_failures(&self) -> Option<u32> {
        self.entries
            .iter()
            .filter(|entry| !entry.removed)
            .map(|entry| entry.failures)
            .min()
    }

    fn is_candidate(&self, index: usize, min_failures: u32) -> bool {
        let entry = &self.entries[index];
        !entry.removed && entry.failures == min_failures
    }

    /// Index the next selection would land on, without moving.
    fn select(&self, advance: bool) -> Option<usize> {
        let min_failures = self.min_failures()?;
        let len = self.entries.len();
        match (self.policy, self.current) {
            (ChooserPolicy::RoundRobin, Some(current)) => {
                let start = if advance { 1 } else { 0 };
                (start..=len)
                    .map(|offset| (current + offset) % len)
                    .find(|index| self.is_candidate(*index, min_failures))
            }
            _ => (0..len).find(|index| self.is_candidate(*index, min_failures)),
        }
    }

    fn no_servers(&self) -> HaError {
        HaError::NoServersAvailable(self.error_detail())
    }
}

impl ServerChooser for DefaultServerChooser {
    fn current(&self) -> HaResult<Url> {
        if let Some(current) = self.current {
            let entry = &self.entries[current];
            if !entry.removed {
                return Ok(entry.uri.clone());
            }
        }
        self.select(false)
            .map(|index| self.entries[index].uri.clone())
            .ok_or_else(|| self.no_servers())
    }

    fn next(&mut self) -> HaResult<Url> {
        let index = self.select(true).ok_or_else(|| self.no_servers())?;
        self.current = Some(index);
        debug!(uri = %self.entries[index].uri, "Selected server");
        Ok(self.entries[index].uri.clone())
    }

    fn add(&mut self, uri: &str) -> HaResult<()> {
        let parsed = parse_uri(uri)?;
        match self.position(&parsed) {
            Some(index) => {
                if self.entries[index].removed {
                    info!(uri = %parsed, "Server restored");
                }
                self.entries[index].removed = false;
            }
            None => self.entries.push(ServerEntry::new(parsed)),
        }
        Ok(())
    }

    fn remove(&mut self, uri: &str) {
        let Ok(parsed) = parse_uri(uri) else {
            warn!(uri, "Ignoring removal of unparseable server uri");
            return;
        };
        if let Some(index) = self.position(&parsed) {
            self.entries[index].removed = true;
            info!(uri = %parsed, "Server removed from rotation");
        }
    }

    fn report_failure(&mut self, uri: &Url, reason: &str) {
        self.last_failure = Some((uri.clone(), reason.to_string()));
        let Some(index) = self.position(uri) else {
            return;
        };
        let entry = &mut self.entries[index];
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = Some(reason.to_string());
        warn!(uri = %uri, failures = entry.failures, reason, "Server failure reported");

        self.current = Some(index);
        if let Some(next) = self.select(true) {
            self.current = Some(next);
        }
    }

    fn report_success(&mut self, uri: &Url) {
        if let Some(index) = self.position(uri) {
            let entry = &mut self.entries[index];
            entry.successes = entry.successes.saturating_add(1);
            entry.failures = 0;
            self.current = Some(index);
        }
    }

    fn error_detail(&self) -> String {
        let Some((uri, reason)) = &self.last_failure else {
            return "no server has been tried".to_string();
        };
        let removed = self.entries.iter().filter(|entry| entry.removed).count();
        format!(
            "{reason} [ details: uri={uri}, servers={}, removed={removed} ]",
            self.entries.len()
        )
    }
}
