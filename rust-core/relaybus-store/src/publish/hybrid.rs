// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Hybrid (memory + block) publish store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// New records land in a memory tier and are spilled, oldest first, into a
// `BlockPublishStore`. A record lives in exactly one tier at a time, and
// every durable sequence is lower than every buffered one.
//
// Spill triggers:
//
// 1. `store` spills synchronously once `max_buffered` records are buffered.
// 2. `flush_to_disk` spills on demand.
// 3. `spawn_flusher` spills on a fixed interval from a tokio task.
//
// A crash therefore loses at most `max_buffered - 1` unacknowledged
// records, plus whatever was stored since the last interval tick when the
// threshold is set higher than the traffic ever reaches.
//
// Sequence numbers are reserved in the durable header `max_buffered` at a
// time, so numbers handed out for records lost from the memory tier are
// never issued again after a reopen.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::BlockBuffer;
use crate::error::StoreResult;
use crate::publish::block::BlockPublishStore;
use crate::publish::{poisoned, wait_for_acks, AckState, PublishStore, StoreReplayer};

/// When a [`HybridPublishStore`] moves buffered records to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridFlushPolicy {
    /// Buffered records that force a synchronous spill inside `store`.
    pub max_buffered: usize,
    /// Period of the background flusher, if one is spawned from config.
    #[serde(default)]
    pub interval: Option<Duration>,
}

impl Default for HybridFlushPolicy {
    fn default() -> Self {
        Self {
            max_buffered: 128,
            interval: None,
        }
    }
}

#[derive(Debug)]
struct HybridState {
    buffered: BTreeMap<u64, Vec<u8>>,
    next_sequence: u64,
    /// Sequences up to here are recorded in the durable tier's header.
    reserved_through: u64,
    last_persisted: u64,
}

/// A publish store that buffers in memory and spills to a block store.
pub struct HybridPublishStore<B: BlockBuffer> {
    state: Mutex<HybridState>,
    acked: Condvar,
    durable: BlockPublishStore<B>,
    policy: HybridFlushPolicy,
}

impl<B: BlockBuffer> HybridPublishStore<B> {
    /// Layer a memory tier over `durable`. Sequence numbering continues
    /// from the durable store's high-water mark.
    pub fn new(durable: BlockPublishStore<B>, policy: HybridFlushPolicy) -> Self {
        let state = HybridState {
            buffered: BTreeMap::new(),
            next_sequence: durable.next_sequence(),
            reserved_through: durable.next_sequence().saturating_sub(1),
            last_persisted: durable.last_persisted(),
        };
        Self {
            state: Mutex::new(state),
            acked: Condvar::new(),
            durable,
            policy: HybridFlushPolicy {
                max_buffered: policy.max_buffered.max(1),
                interval: policy.interval,
            },
        }
    }

    /// The flush policy in force.
    pub fn policy(&self) -> &HybridFlushPolicy {
        &self.policy
    }

    /// Records held only in memory.
    pub fn buffered_count(&self) -> usize {
        self.state.lock().map(|state| state.buffered.len()).unwrap_or(0)
    }

    /// Borrow the durable tier.
    pub fn durable(&self) -> &BlockPublishStore<B> {
        &self.durable
    }

    /// Move every buffered record to the durable tier and sync it.
    /// Returns how many records were moved.
    pub fn flush_to_disk(&self) -> StoreResult<usize> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        self.spill(&mut state)
    }

    fn spill(&self, state: &mut HybridState) -> StoreResult<usize> {
        let mut moved = 0;
        while let Some((sequence, payload)) = state.buffered.pop_first() {
            if let Err(error) = self.durable.store_at(sequence, &payload) {
                state.buffered.insert(sequence, payload);
                if moved > 0 {
                    self.durable.sync()?;
                }
                return Err(error);
            }
            moved += 1;
        }
        if moved > 0 {
            self.durable.sync()?;
            debug!(moved, "Spilled buffered publish records");
        }
        Ok(moved)
    }
}

impl<B: BlockBuffer + 'static> HybridPublishStore<B> {
    /// Spill on a fixed interval from a tokio task. The task ends when the
    /// store is dropped. Must be called from within a tokio runtime.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(error) = store.flush_to_disk() {
                    warn!(%error, "Background spill of publish records failed");
                }
            }
        })
    }
}

impl<B: BlockBuffer> PublishStore for HybridPublishStore<B> {
    fn store(&self, payload: &[u8]) -> StoreResult<u64> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let sequence = state.next_sequence;
        if sequence > state.reserved_through {
            let through = sequence + self.policy.max_buffered as u64;
            self.durable.reserve_through(through)?;
            state.reserved_through = through;
        }
        state.next_sequence += 1;
        state.buffered.insert(sequence, payload.to_vec());
        if state.buffered.len() >= self.policy.max_buffered {
            if let Err(error) = self.spill(&mut state) {
                // The new record is the newest, so a failed spill never moved it.
                state.buffered.remove(&sequence);
                state.next_sequence = sequence;
                return Err(error);
            }
        }
        Ok(sequence)
    }

    fn discard(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.buffered.remove(&sequence).is_none() {
            self.durable.discard(sequence)?;
        }
        state.last_persisted = state.last_persisted.max(self.durable.last_persisted());
        if sequence < state.next_sequence {
            state.last_persisted = state.last_persisted.max(sequence);
        }
        self.acked.notify_all();
        Ok(())
    }

    fn discard_up_to(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let ceiling = sequence.min(state.next_sequence.saturating_sub(1));
        self.durable.discard_up_to(ceiling)?;
        let retained = state.buffered.split_off(&(ceiling + 1));
        state.buffered = retained;
        state.last_persisted = state.last_persisted.max(ceiling);
        self.acked.notify_all();
        Ok(())
    }

    fn replay_from(&self, after: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<()> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        self.durable.replay_from(after, replayer)?;
        for (sequence, payload) in state.buffered.range(after.saturating_add(1)..) {
            replayer.replay(*sequence, payload)?;
        }
        Ok(())
    }

    fn replay_single(&self, sequence: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<bool> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(payload) = state.buffered.get(&sequence) {
            replayer.replay(sequence, payload)?;
            return Ok(true);
        }
        self.durable.replay_single(sequence, replayer)
    }

    fn state(&self, sequence: u64) -> AckState {
        let buffered = self
            .state
            .lock()
            .map(|state| state.buffered.contains_key(&sequence))
            .unwrap_or(false);
        if buffered {
            AckState::Pending
        } else {
            self.durable.state(sequence)
        }
    }

    fn unpersisted_count(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.buffered.len() + self.durable.unpersisted_count(),
            Err(_) => 0,
        }
    }

    fn lowest_unpersisted(&self) -> Option<u64> {
        let state = self.state.lock().ok()?;
        self.durable
            .lowest_unpersisted()
            .or_else(|| state.buffered.keys().next().copied())
    }

    fn last_persisted(&self) -> u64 {
        self.state.lock().map(|state| state.last_persisted).unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        self.state.lock().map(|state| state.next_sequence).unwrap_or(0)
    }

    fn flush(&self, timeout: Duration) -> StoreResult<()> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        wait_for_acks(state, &self.acked, timeout, |state| {
            state.buffered.len() + self.durable.unpersisted_count()
        })
    }

    fn sync(&self) -> StoreResult<()> {
        self.flush_to_disk().map(|_| ())
    }

    fn name(&self) -> &str {
        "hybrid"
    }
}

impl<B: BlockBuffer> std::fmt::Debug for HybridPublishStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridPublishStore")
            .field("policy", &self.policy)
            .field("buffered", &self.buffered_count())
            .field("durable", &self.durable)
            .finish()
    }
}
