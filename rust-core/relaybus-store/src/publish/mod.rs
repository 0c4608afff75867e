// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Publish store contract
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A publish store keeps every outbound message from the moment `store`
// returns until the server acknowledges it, so that a reconnect (or a
// process restart, for the durable variants) can replay whatever the
// server never confirmed.
//
// Three variants implement the same `PublishStore` trait and are picked at
// construction time:
//
// - `MemoryPublishStore`  -- fastest; pending records die with the process.
// - `BlockPublishStore`   -- every `store` is written and synced to a block
//                            region before it returns.
// - `HybridPublishStore`  -- buffers in memory and spills to a block store;
//                            trades a bounded crash-loss window for latency.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub mod block;
pub mod hybrid;
pub mod memory;

pub use block::{BlockPublishStore, BlockPublishStoreConfig};
pub use hybrid::{HybridFlushPolicy, HybridPublishStore};
pub use memory::MemoryPublishStore;

// ---------------------------------------------------------------------------
// AckState / SyncMode
// ---------------------------------------------------------------------------

/// Where a publish record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// Stored, not yet acknowledged by the server. Replayed on reconnect.
    Pending,
    /// Acknowledged; its storage has not been reclaimed yet.
    Acknowledged,
    /// Acknowledged and reclaimed.
    Discarded,
}

/// How often a durable store forces written data to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync inside every `store` and `discard`. A record whose `store`
    /// returned survives a crash.
    Fsync,
    /// Sync at most once per interval. Records stored since the last sync
    /// may be lost on crash.
    Periodic(Duration),
    /// Leave syncing to the OS page cache and explicit `sync()` calls.
    Async,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Fsync
    }
}

// ---------------------------------------------------------------------------
// StoreReplayer
// ---------------------------------------------------------------------------

/// Receives records during [`PublishStore::replay`].
///
/// Returning an error stops the replay; the store's acknowledgement state is
/// untouched either way, so the caller can resume with
/// [`PublishStore::replay_from`].
pub trait StoreReplayer {
    /// Called once per pending record, in ascending sequence order.
    fn replay(&mut self, sequence: u64, payload: &[u8]) -> StoreResult<()>;
}

impl<F> StoreReplayer for F
where
    F: FnMut(u64, &[u8]) -> StoreResult<()>,
{
    fn replay(&mut self, sequence: u64, payload: &[u8]) -> StoreResult<()> {
        self(sequence, payload)
    }
}

/// A replayer that copies every record out, for callers that need to send
/// them somewhere asynchronous after the store lock is released.
#[derive(Debug, Default)]
pub struct CollectingReplayer {
    /// The records seen, in replay order.
    pub records: Vec<(u64, Vec<u8>)>,
}

impl StoreReplayer for CollectingReplayer {
    fn replay(&mut self, sequence: u64, payload: &[u8]) -> StoreResult<()> {
        self.records.push((sequence, payload.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PublishStore
// ---------------------------------------------------------------------------

/// The capability every publish store variant provides.
///
/// All methods take `&self`; each implementation serialises its own state
/// behind a single mutex so publishers, the acknowledgement reader and a
/// background flusher can share one instance.
pub trait PublishStore: Send + Sync {
    /// Assign the next sequence number to `payload` and keep it until it is
    /// acknowledged. Durable variants persist before returning.
    fn store(&self, payload: &[u8]) -> StoreResult<u64>;

    /// Mark one record acknowledged. Unknown or already-discarded sequences
    /// are a no-op.
    fn discard(&self, sequence: u64) -> StoreResult<()>;

    /// Mark every record up to and including `sequence` acknowledged.
    fn discard_up_to(&self, sequence: u64) -> StoreResult<()>;

    /// Replay every pending record in ascending sequence order.
    fn replay(&self, replayer: &mut dyn StoreReplayer) -> StoreResult<()> {
        self.replay_from(0, replayer)
    }

    /// Replay pending records with a sequence strictly greater than `after`.
    fn replay_from(&self, after: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<()>;

    /// Replay exactly one record. Returns `false` if it is not pending.
    fn replay_single(&self, sequence: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<bool>;

    /// Lifecycle state of `sequence`. Sequences never assigned report
    /// `Discarded`.
    fn state(&self, sequence: u64) -> AckState;

    /// Number of records still pending.
    fn unpersisted_count(&self) -> usize;

    /// Smallest pending sequence, if any record is pending.
    fn lowest_unpersisted(&self) -> Option<u64>;

    /// Highest sequence known to be acknowledged (0 if none).
    fn last_persisted(&self) -> u64;

    /// The sequence the next `store` will assign.
    fn next_sequence(&self) -> u64;

    /// Block until every pending record is acknowledged or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> StoreResult<()>;

    /// Force written data to stable storage. A no-op for memory stores.
    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// Shared `flush` helper: wait on `condvar` until `pending` reports zero.
pub(crate) fn wait_for_acks<T>(
    guard: std::sync::MutexGuard<'_, T>,
    condvar: &std::sync::Condvar,
    timeout: Duration,
    pending: impl Fn(&T) -> usize,
) -> StoreResult<()> {
    let (guard, _) = condvar
        .wait_timeout_while(guard, timeout, |state| pending(state) > 0)
        .map_err(|_| poisoned())?;
    let remaining = pending(&guard);
    if remaining > 0 {
        return Err(StoreError::FlushTimeout { remaining });
    }
    Ok(())
}

pub(crate) fn poisoned() -> StoreError {
    StoreError::Backend("store mutex poisoned by a panicking thread".to_string())
}
