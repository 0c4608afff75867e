// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Block-backed persistent publish store
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every record is one block chain whose head carries the record's sequence
// number. An acknowledgement is made durable by setting `ACKED_FLAG` on the
// head block; the chain itself is freed later, in batches. Before any chain
// is freed the store writes its high-water mark into the region metadata,
// so sequence numbers keep increasing after a reopen even when every
// record has been reclaimed.
//
// Metadata layout (little-endian):
//
// ```text
// [8 bytes: highest sequence ever assigned]
// [8 bytes: highest sequence known acknowledged]
// ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{BlockAllocator, BlockAllocatorConfig, BlockIndex};
use crate::buffer::{BlockBuffer, MemoryBuffer, MmapBuffer};
use crate::error::{StoreError, StoreResult};
use crate::publish::{poisoned, wait_for_acks, AckState, PublishStore, StoreReplayer, SyncMode};

/// Head-block flag marking a record the server has acknowledged.
pub const ACKED_FLAG: u8 = 0x10;

const METADATA_LEN: usize = 16;

/// Configuration for a [`BlockPublishStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPublishStoreConfig {
    /// Shape of the block region when it is first created.
    #[serde(default)]
    pub allocator: BlockAllocatorConfig,
    /// When `store` and `discard` force data to stable storage.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Acknowledged records accumulated before their blocks are freed.
    #[serde(default = "default_reclaim_batch")]
    pub reclaim_batch: usize,
}

fn default_reclaim_batch() -> usize {
    64
}

impl Default for BlockPublishStoreConfig {
    fn default() -> Self {
        Self {
            allocator: BlockAllocatorConfig::default(),
            sync_mode: SyncMode::default(),
            reclaim_batch: default_reclaim_batch(),
        }
    }
}

struct BlockState<B: BlockBuffer> {
    allocator: BlockAllocator<B>,
    /// Sequence -> head block of every record still awaiting an ack.
    pending: BTreeMap<u64, BlockIndex>,
    /// Acknowledged records whose blocks are not yet freed.
    acknowledged: BTreeMap<u64, BlockIndex>,
    next_sequence: u64,
    /// Highest sequence promised to a caller that assigns its own (the
    /// hybrid store), recorded so a reopen never reissues it.
    reserved_through: u64,
    last_persisted: u64,
    last_sync: Instant,
}

impl<B: BlockBuffer> BlockState<B> {
    fn maybe_sync(&mut self, mode: SyncMode) -> StoreResult<()> {
        match mode {
            SyncMode::Fsync => {
                self.allocator.sync()?;
                self.last_sync = Instant::now();
            }
            SyncMode::Periodic(interval) => {
                if self.last_sync.elapsed() >= interval {
                    self.allocator.sync()?;
                    self.last_sync = Instant::now();
                }
            }
            SyncMode::Async => {}
        }
        Ok(())
    }

    fn write_record(&mut self, sequence: u64, payload: &[u8]) -> StoreResult<()> {
        let index = self.allocator.allocate(payload.len())?;
        if let Err(error) = self.allocator.write(index, sequence, payload) {
            // Hand the reservation back so a failed write does not leak blocks.
            let _ = self.allocator.free(index);
            return Err(error);
        }
        self.pending.insert(sequence, index);
        self.next_sequence = sequence + 1;
        Ok(())
    }

    fn acknowledge(&mut self, sequence: u64) -> StoreResult<bool> {
        let index = match self.pending.get(&sequence) {
            Some(index) => *index,
            None => return Ok(false),
        };
        self.allocator.set_user_flags(index, ACKED_FLAG)?;
        self.pending.remove(&sequence);
        self.acknowledged.insert(sequence, index);
        self.last_persisted = self.last_persisted.max(sequence);
        Ok(true)
    }

    fn encode_metadata(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        let high_water = self.next_sequence.saturating_sub(1).max(self.reserved_through);
        out[0..8].copy_from_slice(&high_water.to_le_bytes());
        out[8..16].copy_from_slice(&self.last_persisted.to_le_bytes());
        out
    }

    fn reclaim(&mut self) -> StoreResult<usize> {
        if self.acknowledged.is_empty() {
            return Ok(0);
        }
        let metadata = self.encode_metadata();
        self.allocator.set_metadata(&metadata)?;
        self.allocator.sync()?;

        let reclaimed = std::mem::take(&mut self.acknowledged);
        for index in reclaimed.values() {
            self.allocator.free(*index)?;
        }
        self.allocator.sync()?;
        self.last_sync = Instant::now();
        debug!(count = reclaimed.len(), "Reclaimed acknowledged publish records");
        Ok(reclaimed.len())
    }
}

fn decode_metadata(metadata: &[u8]) -> (u64, u64) {
    if metadata.len() < METADATA_LEN {
        return (0, 0);
    }
    let mut high_water = [0u8; 8];
    let mut persisted = [0u8; 8];
    high_water.copy_from_slice(&metadata[0..8]);
    persisted.copy_from_slice(&metadata[8..16]);
    (u64::from_le_bytes(high_water), u64::from_le_bytes(persisted))
}

/// A persistent publish store over a [`BlockAllocator`].
///
/// With the default [`SyncMode::Fsync`], a record whose `store` returned is
/// on stable storage and will be replayed after a crash until it is
/// discarded.
pub struct BlockPublishStore<B: BlockBuffer> {
    state: Mutex<BlockState<B>>,
    acked: Condvar,
    sync_mode: SyncMode,
    reclaim_batch: usize,
}

impl BlockPublishStore<MmapBuffer> {
    /// Open (or create) a store file.
    pub fn open_file(path: impl AsRef<Path>, config: BlockPublishStoreConfig) -> StoreResult<Self> {
        let buffer = MmapBuffer::open(path)?;
        Self::open(buffer, config)
    }
}

impl BlockPublishStore<MemoryBuffer> {
    /// A store over a heap buffer. Useful in tests and as a block-layout
    /// twin of [`MemoryPublishStore`](super::MemoryPublishStore).
    pub fn in_memory(config: BlockPublishStoreConfig) -> StoreResult<Self> {
        Self::open(MemoryBuffer::new(), config)
    }
}

impl<B: BlockBuffer> BlockPublishStore<B> {
    /// Open a store over `buffer`, recovering every record already in it.
    pub fn open(buffer: B, config: BlockPublishStoreConfig) -> StoreResult<Self> {
        let allocator = BlockAllocator::open(buffer, config.allocator)?;
        let (high_water, recorded_persisted) = decode_metadata(allocator.metadata());

        let mut pending = BTreeMap::new();
        let mut acknowledged = BTreeMap::new();
        let mut max_sequence = high_water;
        let mut last_persisted = recorded_persisted;
        for record in allocator.records()? {
            max_sequence = max_sequence.max(record.sequence);
            if record.user_flags & ACKED_FLAG != 0 {
                last_persisted = last_persisted.max(record.sequence);
                acknowledged.insert(record.sequence, record.index);
            } else if pending.insert(record.sequence, record.index).is_some() {
                return Err(StoreError::corrupt(
                    record.index.0,
                    format!("sequence {} stored twice", record.sequence),
                ));
            }
        }

        info!(
            pending = pending.len(),
            acknowledged = acknowledged.len(),
            next_sequence = max_sequence + 1,
            "Opened block publish store"
        );
        Ok(Self {
            state: Mutex::new(BlockState {
                allocator,
                pending,
                acknowledged,
                next_sequence: max_sequence + 1,
                reserved_through: max_sequence,
                last_persisted,
                last_sync: Instant::now(),
            }),
            acked: Condvar::new(),
            sync_mode: config.sync_mode,
            reclaim_batch: config.reclaim_batch.max(1),
        })
    }

    /// Free the blocks of every acknowledged record now, instead of waiting
    /// for the batch to fill. Returns how many records were reclaimed.
    pub fn reclaim(&self) -> StoreResult<usize> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.reclaim()
    }

    /// Number of acknowledged records still occupying blocks.
    pub fn unreclaimed_count(&self) -> usize {
        self.state.lock().map(|state| state.acknowledged.len()).unwrap_or(0)
    }

    /// Data blocks in the region.
    pub fn capacity(&self) -> u32 {
        self.state.lock().map(|state| state.allocator.capacity()).unwrap_or(0)
    }

    /// Write a record under a caller-assigned sequence. Used by the hybrid
    /// store when it spills buffered records; the caller syncs afterwards.
    pub(crate) fn store_at(&self, sequence: u64, payload: &[u8]) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if sequence < state.next_sequence {
            return Err(StoreError::Replay {
                sequence,
                reason: format!("sequence already assigned (next is {})", state.next_sequence),
            });
        }
        state.write_record(sequence, payload)
    }

    /// Record `sequence` as issued without writing a record for it.
    /// Reopening the store resumes numbering after it.
    pub(crate) fn reserve_through(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if sequence <= state.reserved_through {
            return Ok(());
        }
        state.reserved_through = sequence;
        let metadata = state.encode_metadata();
        state.allocator.set_metadata(&metadata)?;
        state.allocator.sync()?;
        state.last_sync = Instant::now();
        Ok(())
    }

    fn after_acknowledge(&self, state: &mut BlockState<B>) -> StoreResult<()> {
        state.maybe_sync(self.sync_mode)?;
        if state.acknowledged.len() >= self.reclaim_batch {
            state.reclaim()?;
        }
        self.acked.notify_all();
        Ok(())
    }
}

impl<B: BlockBuffer> PublishStore for BlockPublishStore<B> {
    fn store(&self, payload: &[u8]) -> StoreResult<u64> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let sequence = state.next_sequence;
        state.write_record(sequence, payload)?;
        state.maybe_sync(self.sync_mode)?;
        debug!(sequence, bytes = payload.len(), "Stored publish record");
        Ok(sequence)
    }

    fn discard(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.acknowledge(sequence)? {
            self.after_acknowledge(&mut state)?;
        }
        Ok(())
    }

    fn discard_up_to(&self, sequence: u64) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let targets: Vec<u64> = state.pending.range(..=sequence).map(|(seq, _)| *seq).collect();
        if targets.is_empty() {
            return Ok(());
        }
        for target in &targets {
            state.acknowledge(*target)?;
        }
        debug!(up_to = sequence, count = targets.len(), "Acknowledged publish records");
        self.after_acknowledge(&mut state)
    }

    fn replay_from(&self, after: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<()> {
        let mut guard = self.state.lock().map_err(|_| poisoned())?;
        let state = &mut *guard;
        for (sequence, index) in state.pending.range(after.saturating_add(1)..) {
            let record = state.allocator.read_record(*index)?;
            let outcome = replayer.replay(*sequence, &record.payload);
            state.allocator.release_read(*index)?;
            outcome?;
        }
        Ok(())
    }

    fn replay_single(&self, sequence: u64, replayer: &mut dyn StoreReplayer) -> StoreResult<bool> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let index = match state.pending.get(&sequence) {
            Some(index) => *index,
            None => return Ok(false),
        };
        let record = state.allocator.read_record(index)?;
        let outcome = replayer.replay(sequence, &record.payload);
        state.allocator.release_read(index)?;
        outcome.map(|_| true)
    }

    fn state(&self, sequence: u64) -> AckState {
        match self.state.lock() {
            Ok(state) if state.pending.contains_key(&sequence) => AckState::Pending,
            Ok(state) if state.acknowledged.contains_key(&sequence) => AckState::Acknowledged,
            Ok(_) => AckState::Discarded,
            Err(_) => {
                warn!(sequence, "State query on a poisoned publish store");
                AckState::Discarded
            }
        }
    }

    fn unpersisted_count(&self) -> usize {
        self.state.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    fn lowest_unpersisted(&self) -> Option<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.pending.keys().next().copied())
    }

    fn last_persisted(&self) -> u64 {
        self.state.lock().map(|state| state.last_persisted).unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        self.state.lock().map(|state| state.next_sequence).unwrap_or(0)
    }

    fn flush(&self, timeout: Duration) -> StoreResult<()> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        wait_for_acks(state, &self.acked, timeout, |state| state.pending.len())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.allocator.sync()?;
        state.last_sync = Instant::now();
        Ok(())
    }

    fn name(&self) -> &str {
        "block"
    }
}

impl<B: BlockBuffer> std::fmt::Debug for BlockPublishStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPublishStore")
            .field("sync_mode", &self.sync_mode)
            .field("reclaim_batch", &self.reclaim_batch)
            .field("pending", &self.unpersisted_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Growth, MIN_BLOCK_SIZE};
    use crate::publish::CollectingReplayer;
    use tempfile::TempDir;

    fn config(reclaim_batch: usize) -> BlockPublishStoreConfig {
        BlockPublishStoreConfig {
            allocator: BlockAllocatorConfig {
                block_size: MIN_BLOCK_SIZE,
                initial_capacity: 4,
                growth: Growth::Grow(4),
            },
            sync_mode: SyncMode::Fsync,
            reclaim_batch,
        }
    }

    fn replayed(store: &dyn PublishStore) -> Vec<(u64, Vec<u8>)> {
        let mut collector = CollectingReplayer::default();
        store.replay(&mut collector).unwrap();
        collector.records
    }

    #[test]
    fn test_store_and_replay_in_order() {
        let store = BlockPublishStore::in_memory(config(64)).unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            store.store(payload).unwrap();
        }
        let records = replayed(&store);
        assert_eq!(
            records,
            vec![(1, b"one".to_vec()), (2, b"two".to_vec()), (3, b"three".to_vec())]
        );
    }

    #[test]
    fn test_reopen_after_crash_replays_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("publish.blk");
        {
            let store = BlockPublishStore::open_file(&path, config(64)).unwrap();
            for sequence in 1..=5u64 {
                store.store(&sequence.to_le_bytes()).unwrap();
            }
            store.discard(2).unwrap();
            store.discard(4).unwrap();
            // Dropped without reclaim: acks live only in head-block flags.
        }

        let store = BlockPublishStore::open_file(&path, config(64)).unwrap();
        let sequences: Vec<u64> = replayed(&store).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(sequences, vec![1, 3, 5]);
        assert_eq!(store.state(2), AckState::Acknowledged);
        assert_eq!(store.last_persisted(), 4);
        assert_eq!(store.store(b"next").unwrap(), 6);
    }

    #[test]
    fn test_sequences_survive_full_reclaim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hwm.blk");
        {
            let store = BlockPublishStore::open_file(&path, config(2)).unwrap();
            store.store(b"a").unwrap();
            store.store(b"b").unwrap();
            store.discard_up_to(2).unwrap();
            assert_eq!(store.unreclaimed_count(), 0);
        }

        let store = BlockPublishStore::open_file(&path, config(2)).unwrap();
        assert_eq!(store.unpersisted_count(), 0);
        assert_eq!(store.store(b"c").unwrap(), 3, "sequence must not be reused");
    }

    #[test]
    fn test_reclaim_is_batched() {
        let store = BlockPublishStore::in_memory(config(3)).unwrap();
        for _ in 0..4 {
            store.store(b"x").unwrap();
        }
        store.discard(1).unwrap();
        store.discard(2).unwrap();
        assert_eq!(store.unreclaimed_count(), 2);
        store.discard(3).unwrap();
        assert_eq!(store.unreclaimed_count(), 0);
        assert_eq!(store.state(3), AckState::Discarded);
        assert_eq!(store.state(4), AckState::Pending);
    }

    #[test]
    fn test_large_payload_spans_blocks() {
        let store = BlockPublishStore::in_memory(config(64)).unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
        let sequence = store.store(&payload).unwrap();

        let mut collector = CollectingReplayer::default();
        assert!(store.replay_single(sequence, &mut collector).unwrap());
        assert_eq!(collector.records[0].1, payload);
    }

    #[test]
    fn test_replayer_error_stops_and_resumes() {
        let store = BlockPublishStore::in_memory(config(64)).unwrap();
        for _ in 0..3 {
            store.store(b"r").unwrap();
        }
        let mut seen = Vec::new();
        let mut failing = |sequence: u64, _payload: &[u8]| {
            if sequence == 2 {
                return Err(StoreError::Replay {
                    sequence,
                    reason: "connection dropped".to_string(),
                });
            }
            seen.push(sequence);
            Ok(())
        };
        assert!(store.replay(&mut failing).is_err());
        assert_eq!(seen, vec![1]);

        let mut collector = CollectingReplayer::default();
        store.replay_from(1, &mut collector).unwrap();
        let resumed: Vec<u64> = collector.records.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(resumed, vec![2, 3]);
        assert_eq!(store.unpersisted_count(), 3);
    }

    #[test]
    fn test_fixed_region_surfaces_store_full() {
        let mut cfg = config(64);
        cfg.allocator.growth = Growth::Fixed;
        let store = BlockPublishStore::in_memory(cfg).unwrap();
        for _ in 0..4 {
            store.store(b"f").unwrap();
        }
        assert!(matches!(store.store(b"f"), Err(StoreError::StoreFull { .. })));
        assert_eq!(store.next_sequence(), 5, "a failed store must not consume a sequence");
    }
}
