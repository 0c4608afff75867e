// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - In-memory publish store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pending records live in a `BTreeMap` keyed by sequence. Survives a
// reconnect, not a process crash.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::StoreResult;
use crate::publish::{poisoned, wait_for_acks, AckState, PublishStore, StoreReplayer};

#[derive(Debug)]
struct MemoryState {
    next_sequence: u64,
    records: BTreeMap<u64, Vec<u8>>,
    last_persisted: u64,
}

/// A publish store that keeps pending records on the heap.
#[derive(Debug)]
pub struct MemoryPublishStore {
    state: Mutex<MemoryState>,
    acked: Condvar,
}

impl MemoryPublishStore {
    /// Create an empty store whose first record gets sequence 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an empty store whose first record gets `first_sequence`.
    pub fn starting_at(first_sequence: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_sequence: first_sequence.max(1),
                records: BTreeMap::new(),
                last_persisted: first_sequence.saturating_sub(1),
            }),
            acked: Condvar::new(),
        }
    }
}

impl Default for MemoryPublishStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishStore for MemoryPublishStore {
    fn store(&self, payload: &[u8]) -> StoreResult<u64> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.records.insert(sequence, payload.to_vec());
        Ok(sequence)
    }

    fn discard(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.records.remove(&sequence).is_some() {
            state.last_persisted = state.last_persisted.max(sequence);
            self.acked.notify_all();
        }
        Ok(())
    }

    fn discard_up_to(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let ceiling = sequence.min(state.next_sequence.saturating_sub(1));
        if ceiling <= state.last_persisted && state.records.range(..=ceiling).next().is_none() {
            return Ok(());
        }
        let retained = state.records.split_off(&(ceiling + 1));
        let dropped = std::mem::replace(&mut state.records, retained).len();
        state.last_persisted = state.last_persisted.max(ceiling);
        debug!(up_to = ceiling, dropped, "Discarded acknowledged publish records");
        self.acked.notify_all();
        Ok(())
    }

    fn replay_from(&self, after: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<()> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        for (sequence, payload) in state.records.range(after.saturating_add(1)..) {
            replayer.replay(*sequence, payload)?;
        }
        Ok(())
    }

    fn replay_single(&self, sequence: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<bool> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        match state.records.get(&sequence) {
            Some(payload) => {
                replayer.replay(sequence, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn state(&self, sequence: u64) -> AckState {
        match self.state.lock() {
            Ok(state) if state.records.contains_key(&sequence) => AckState::Pending,
            _ => AckState::Discarded,
        }
    }

    fn unpersisted_count(&self) -> usize {
        self.state.lock().map(|state| state.records.len()).unwrap_or(0)
    }

    fn lowest_unpersisted(&self) -> Option<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.records.keys().next().copied())
    }

    fn last_persisted(&self) -> u64 {
        self.state.lock().map(|state| state.last_persisted).unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        self.state.lock().map(|state| state.next_sequence).unwrap_or(0)
    }

    fn flush(&self, timeout: Duration) -> StoreResult<()> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        wait_for_acks(state, &self.acked, timeout, |state| state.records.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
