// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client - Reconnect backoff
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::error::{HaError, HaResult};

/// Computes how long to wait before the next connection attempt.
///
/// The client calls [`reset`](Self::reset) after every successful
/// connection; without it backoff from one outage would carry into the next.
pub trait ReconnectDelayStrategy: Send {
    /// Wait before connecting to `uri`. Fails with
    /// [`HaError::RetriesExhausted`] once the strategy gives up.
    fn connect_wait_duration(&mut self, uri: &Url) -> HaResult<Duration>;

    fn reset(&mut self);
}

/// Total retry time bookkeeping shared by both strategies.
#[derive(Debug, Clone, Default)]
struct RetryClock {
    max_retry_time: Option<Duration>,
    started: Option<Instant>,
    attempts: u32,
}

impl RetryClock {
    fn new(max_retry_time: Option<Duration>) -> Self {
        Self {
            max_retry_time,
            ..Self::default()
        }
    }

    fn tick(&mut self) -> HaResult<()> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if let Some(limit) = self.max_retry_time {
            if started.elapsed() >= limit {
                return Err(HaError::RetriesExhausted {
                    attempts: self.attempts,
                });
            }
        }
        self.attempts = self.attempts.saturating_add(1);
        Ok(())
    }

    fn reset(&mut self) {
        self.started = None;
        self.attempts = 0;
    }
}

/// The same wait before every attempt.
#[derive(Debug, Clone)]
pub struct FixedDelayStrategy {
    delay: Duration,
    clock: RetryClock,
}

impl FixedDelayStrategy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            clock: RetryClock::default(),
        }
    }

    pub fn with_max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.clock = RetryClock::new(Some(max_retry_time));
        self
    }
}

impl ReconnectDelayStrategy for FixedDelayStrategy {
    fn connect_wait_duration(&mut self, _uri: &Url) -> HaResult<Duration> {
        self.clock.tick()?;
        Ok(self.delay)
    }

    fn reset(&mut self) {
        self.clock.reset();
    }
}

/// Backoff that multiplies per endpoint, up to a cap.
///
/// Each endpoint has its own attempt count, so failing over to a fresh
/// server starts from `base`. Jitter adds a random amount up to `jitter`
/// before the cap is applied.
#[derive(Debug, Clone)]
pub struct ExponentialDelayStrategy {
    base: Duration,
    multiplier: f64,
    max: Duration,
    jitter: Duration,
    attempts: HashMap<String, u32>,
    clock: RetryClock,
}

impl ExponentialDelayStrategy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max: max.max(base),
            jitter: Duration::ZERO,
            attempts: HashMap::new(),
            clock: RetryClock::default(),
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.clock = RetryClock::new(Some(max_retry_time));
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = self.base.as_millis() as f64 * factor;
        let max_millis = self.max.as_millis() as f64;
        Duration::from_millis(millis.min(max_millis) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        (delay + Duration::from_millis(extra)).min(self.max)
    }
}

impl Default for ExponentialDelayStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), 2.0, Duration::from_secs(20))
    }
}

impl ReconnectDelayStrategy for ExponentialDelayStrategy {
    fn connect_wait_duration(&mut self, uri: &Url) -> HaResult<Duration> {
        self.clock.tick()?;
        let attempt = self.attempts.entry(uri.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);

        let delay = self.jittered(self.backoff(current));
        debug!(uri = %uri, attempt = current + 1, delay_ms = delay.as_millis() as u64, "Reconnect backoff");
        Ok(delay)
    }

    fn reset(&mut self) {
        self.attempts.clear();
        self.clock.reset();
    }
}
