// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Fixed-size block allocator
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// An arena of fixed-size blocks laid over a `BlockBuffer`. Records are
// addressed by the index of their head block; a record larger than one
// block continues in a chain linked through the block headers. Growth only
// ever appends indices, so an index handed out stays valid for the life
// of the region.
//
// Region layout (all integers little-endian):
//
// ```text
// block_size bytes of region header:
//   [8 bytes: magic "RBUSBLK1"]
//   [4 bytes: format version (u32)]
//   [4 bytes: block size (u32)]
//   [4 bytes: capacity in data blocks (u32)]
//   [4 bytes: metadata length (u32)]
//   [4 bytes: crc32 of the 24 bytes above + metadata]
//   [N bytes: metadata, at most 64]
// capacity x block_size bytes of data blocks, each:
//   [1 byte:  flags]              -- 0x01 occupied, 0x02 head, 0xF0 store-defined
//   [3 bytes: reserved]
//   [4 bytes: length (u32)]       -- payload bytes held by this block
//   [8 bytes: sequence (u64)]
//   [4 bytes: next block (u32)]   -- u32::MAX terminates the chain
//   [4 bytes: crc32]              -- over the 20 bytes above + this block's payload
//   [block_size - 24 bytes: payload]
// ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::BlockBuffer;
use crate::error::{StoreError, StoreResult};

/// Magic bytes at the start of every block region.
pub const MAGIC: &[u8; 8] = b"RBUSBLK1";

/// The region format this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the per-block header.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Smallest block size accepted; the region header must fit in one block.
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Largest store-owned metadata area kept in the region header.
pub const MAX_METADATA_LEN: usize = 64;

/// Sentinel for "no next block".
const NO_BLOCK: u32 = u32::MAX;

/// Index used in errors that concern the region header itself.
const HEADER_INDEX: u32 = u32::MAX;

const REGION_HEADER_FIXED: usize = 8 + 4 + 4 + 4 + 4 + 4;

/// Block occupancy flag.
pub const FLAG_OCCUPIED: u8 = 0x01;
/// Marks the first block of a record.
pub const FLAG_HEAD: u8 = 0x02;
/// Bits a store may use for its own per-record state.
pub const USER_FLAG_MASK: u8 = 0xF0;

// ---------------------------------------------------------------------------
// BlockIndex / Growth / config
// ---------------------------------------------------------------------------

/// Position of a block in the region. Stable across growth and reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What `allocate` does when the free list runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Growth {
    /// Fail with [`StoreError::StoreFull`].
    Fixed,
    /// Extend the region by at least this many blocks.
    Grow(u32),
}

/// Shape of a freshly created region. An existing region keeps the block
/// size and capacity recorded in its header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAllocatorConfig {
    /// Bytes per block, header included.
    pub block_size: u32,
    /// Data blocks created up front.
    pub initial_capacity: u32,
    /// Behaviour when every block is in use.
    pub growth: Growth,
}

impl Default for BlockAllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_capacity: 256,
            growth: Growth::Grow(256),
        }
    }
}

/// A record read back from the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Head block of the record.
    pub index: BlockIndex,
    /// Sequence number written with the record.
    pub sequence: u64,
    /// Store-defined flag bits (`USER_FLAG_MASK`).
    pub user_flags: u8,
    /// The payload, reassembled across the chain.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    flags: u8,
    length: u32,
    sequence: u64,
    next: u32,
    crc: u32,
}

impl BlockHeader {
    fn encode_fields(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0] = self.flags;
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        out[16..20].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[8..16]);
        Self {
            flags: bytes[0],
            length: u32_at(4),
            sequence: u64::from_le_bytes(sequence),
            next: u32_at(16),
            crc: u32_at(20),
        }
    }

    fn checksum(&self, payload: &[u8]) -> u32 {
        let mut hasher = Crc32Hasher::new();
        hasher.update(&self.encode_fields());
        hasher.update(payload);
        hasher.finalize()
    }

    fn is_occupied(&self) -> bool {
        self.flags & FLAG_OCCUPIED != 0
    }

    fn is_head(&self) -> bool {
        self.flags & FLAG_HEAD != 0
    }
}

// ---------------------------------------------------------------------------
// BlockAllocator
// ---------------------------------------------------------------------------

/// Fixed-size block storage over a [`BlockBuffer`].
///
/// The allocator is not internally synchronised: each store owns one and
/// guards it with the store's single mutex.
pub struct BlockAllocator<B: BlockBuffer> {
    buffer: B,
    block_size: u32,
    capacity: u32,
    growth: Growth,
    free: BTreeSet<u32>,
    /// Head index -> every block of the record, head first.
    chains: HashMap<u32, Vec<u32>>,
    /// Heads handed out by `allocate` and not yet written.
    reserved: HashSet<u32>,
    pins: HashMap<u32, usize>,
    deferred_free: HashSet<u32>,
    metadata: Vec<u8>,
}

impl<B: BlockBuffer> BlockAllocator<B> {
    /// Open a region, initialising it if the buffer is empty.
    ///
    /// For an existing region the header is validated (magic, version,
    /// checksum, size) and every block is scanned to rebuild the free list
    /// and the record chains. Blocks left behind by an interrupted write or
    /// free are reclaimed.
    pub fn open(buffer: B, config: BlockAllocatorConfig) -> StoreResult<Self> {
        if buffer.is_empty() {
            return Self::initialise(buffer, config);
        }

        let mut allocator = Self::read_header(buffer, config.growth)?;
        if allocator.block_size != config.block_size {
            debug!(
                recorded = allocator.block_size,
                requested = config.block_size,
                "Existing region keeps its recorded block size"
            );
        }
        allocator.scan()?;
        info!(
            buffer = allocator.buffer.name(),
            capacity = allocator.capacity,
            records = allocator.chains.len(),
            free = allocator.free.len(),
            "Opened block region"
        );
        Ok(allocator)
    }

    fn initialise(mut buffer: B, config: BlockAllocatorConfig) -> StoreResult<Self> {
        if buffer.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let block_size = config.block_size.max(MIN_BLOCK_SIZE);
        let capacity = config.initial_capacity.max(1);
        buffer.grow((capacity as u64 + 1) * block_size as u64)?;

        let mut allocator = Self {
            buffer,
            block_size,
            capacity,
            growth: config.growth,
            free: (0..capacity).collect(),
            chains: HashMap::new(),
            reserved: HashSet::new(),
            pins: HashMap::new(),
            deferred_free: HashSet::new(),
            metadata: Vec::new(),
        };
        allocator.write_region_header()?;
        allocator.buffer.sync()?;
        info!(block_size, capacity, "Initialised block region");
        Ok(allocator)
    }

    fn read_header(buffer: B, growth: Growth) -> StoreResult<Self> {
        if buffer.len() < REGION_HEADER_FIXED as u64 {
            return Err(StoreError::corrupt(HEADER_INDEX, "region shorter than its header"));
        }
        let mut fixed = [0u8; REGION_HEADER_FIXED];
        buffer.read_at(0, &mut fixed)?;

        if &fixed[0..8] != MAGIC {
            return Err(StoreError::corrupt(HEADER_INDEX, "bad magic"));
        }
        let u32_at = |at: usize| u32::from_le_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]);
        let version = u32_at(8);
        if version != FORMAT_VERSION {
            return Err(StoreError::IncompatibleStoreVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let block_size = u32_at(12);
        let capacity = u32_at(16);
        let metadata_len = u32_at(20) as usize;
        let stored_crc = u32_at(24);

        if block_size < MIN_BLOCK_SIZE || metadata_len > MAX_METADATA_LEN {
            return Err(StoreError::corrupt(HEADER_INDEX, "implausible header fields"));
        }
        let mut metadata = vec![0u8; metadata_len];
        buffer.read_at(REGION_HEADER_FIXED as u64, &mut metadata)?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&fixed[0..24]);
        hasher.update(&metadata);
        let actual = hasher.finalize();
        if actual != stored_crc {
            return Err(StoreError::corrupt(
                HEADER_INDEX,
                format!("header crc {stored_crc:#010x} != {actual:#010x}"),
            ));
        }

        let needed = (capacity as u64 + 1) * block_size as u64;
        if buffer.len() < needed {
            return Err(StoreError::corrupt(
                HEADER_INDEX,
                format!("region is {} bytes, header requires {needed}", buffer.len()),
            ));
        }

        Ok(Self {
            buffer,
            block_size,
            capacity,
            growth,
            free: BTreeSet::new(),
            chains: HashMap::new(),
            reserved: HashSet::new(),
            pins: HashMap::new(),
            deferred_free: HashSet::new(),
            metadata,
        })
    }

    fn scan(&mut self) -> StoreResult<()> {
        let mut occupied: HashMap<u32, BlockHeader> = HashMap::new();
        for index in 0..self.capacity {
            let (header, _) = self.read_block(index)?;
            if header.is_occupied() {
                occupied.insert(index, header);
            } else {
                self.free.insert(index);
            }
        }

        let mut claimed: HashSet<u32> = HashSet::new();
        let mut heads: Vec<u32> = occupied
            .iter()
            .filter(|(_, header)| header.is_head())
            .map(|(index, _)| *index)
            .collect();
        heads.sort_unstable();

        for head in heads {
            let mut chain = vec![head];
            claimed.insert(head);
            let mut next = occupied[&head].next;
            while next != NO_BLOCK {
                let header = occupied.get(&next).ok_or_else(|| {
                    StoreError::corrupt(head, format!("chain points at unoccupied block {next}"))
                })?;
                if header.is_head() || !claimed.insert(next) {
                    return Err(StoreError::corrupt(head, format!("chain revisits block {next}")));
                }
                chain.push(next);
                next = header.next;
            }
            self.chains.insert(head, chain);
        }

        let orphans: Vec<u32> = occupied
            .keys()
            .filter(|index| !claimed.contains(index))
            .copied()
            .collect();
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Reclaiming blocks left by an interrupted write");
            for index in orphans {
                if !self.buffer.is_read_only() {
                    self.clear_block(index)?;
                }
                self.free.insert(index);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Public contract
    // -----------------------------------------------------------------------

    /// Reserve enough blocks for `size` payload bytes and return the head.
    pub fn allocate(&mut self, size: usize) -> StoreResult<BlockIndex> {
        if self.buffer.is_read_only() {
            return Err(StoreError::StoreFull {
                capacity: self.capacity,
            });
        }
        let needed = self.blocks_for(size);
        if self.free.len() < needed {
            match self.growth {
                Growth::Fixed => {
                    return Err(StoreError::StoreFull {
                        capacity: self.capacity,
                    })
                }
                Growth::Grow(step) => {
                    let shortfall = (needed - self.free.len()) as u32;
                    let new_capacity = self.capacity.saturating_add(step.max(shortfall));
                    self.resize(new_capacity)?;
                }
            }
        }

        let chain: Vec<u32> = self.free.iter().take(needed).copied().collect();
        for index in &chain {
            self.free.remove(index);
        }
        let head = chain[0];
        self.reserved.insert(head);
        self.chains.insert(head, chain);
        Ok(BlockIndex(head))
    }

    /// Write a record into a chain returned by [`allocate`](Self::allocate),
    /// or overwrite an existing record in place when it still fits.
    ///
    /// Continuation blocks are written before the head so a crash part-way
    /// through never leaves a readable head over half-written data. The
    /// write is not durable until [`sync`](Self::sync).
    pub fn write(&mut self, index: BlockIndex, sequence: u64, payload: &[u8]) -> StoreResult<()> {
        let chain = self
            .chains
            .get(&index.0)
            .cloned()
            .ok_or(StoreError::InvalidBlock(index.0))?;
        let per_block = self.payload_capacity();
        let reserved = chain.len() * per_block;
        if payload.len() > reserved {
            return Err(StoreError::PayloadTooLarge {
                size: payload.len(),
                reserved,
            });
        }

        for position in (0..chain.len()).rev() {
            let start = (position * per_block).min(payload.len());
            let end = ((position + 1) * per_block).min(payload.len());
            let mut flags = FLAG_OCCUPIED;
            if position == 0 {
                flags |= FLAG_HEAD;
            }
            let header = BlockHeader {
                flags,
                length: (end - start) as u32,
                sequence,
                next: chain.get(position + 1).copied().unwrap_or(NO_BLOCK),
                crc: 0,
            };
            self.write_block(chain[position], header, &payload[start..end])?;
        }

        self.reserved.remove(&index.0);
        Ok(())
    }

    /// Read a record and pin it until [`release_read`](Self::release_read).
    pub fn read(&mut self, index: BlockIndex) -> StoreResult<Vec<u8>> {
        Ok(self.read_record(index)?.payload)
    }

    /// Read a record with its sequence and flags, pinning it.
    pub fn read_record(&mut self, index: BlockIndex) -> StoreResult<BlockRecord> {
        let record = self.load_record(index)?;
        *self.pins.entry(index.0).or_insert(0) += 1;
        Ok(record)
    }

    /// Drop one read pin. A `free` that arrived while the record was pinned
    /// takes effect when the last pin is released.
    pub fn release_read(&mut self, index: BlockIndex) -> StoreResult<()> {
        let remaining = match self.pins.get_mut(&index.0) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            self.pins.remove(&index.0);
            if self.deferred_free.remove(&index.0) {
                self.release_chain(index.0)?;
            }
        }
        Ok(())
    }

    /// Return a record's blocks to the free list.
    pub fn free(&mut self, index: BlockIndex) -> StoreResult<()> {
        if !self.chains.contains_key(&index.0) {
            return Err(StoreError::InvalidBlock(index.0));
        }
        if self.pins.contains_key(&index.0) {
            debug!(block = %index, "Deferring free of pinned record");
            self.deferred_free.insert(index.0);
            return Ok(());
        }
        self.release_chain(index.0)
    }

    /// Grow the region to `new_capacity` data blocks. Existing indices and
    /// contents are untouched; requests that would shrink are ignored.
    pub fn resize(&mut self, new_capacity: u32) -> StoreResult<()> {
        if self.buffer.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        if new_capacity <= self.capacity {
            debug!(current = self.capacity, requested = new_capacity, "Ignoring non-growing resize");
            return Ok(());
        }
        self.buffer
            .grow((new_capacity as u64 + 1) * self.block_size as u64)?;
        let old_capacity = self.capacity;
        self.capacity = new_capacity;
        self.free.extend(old_capacity..new_capacity);
        self.write_region_header()?;
        info!(old_capacity, new_capacity, "Grew block region");
        Ok(())
    }

    /// Replace the store-defined flag bits of a record's head block.
    pub fn set_user_flags(&mut self, index: BlockIndex, user_flags: u8) -> StoreResult<()> {
        if !self.chains.contains_key(&index.0) || self.reserved.contains(&index.0) {
            return Err(StoreError::InvalidBlock(index.0));
        }
        let (mut header, payload) = self.read_block(index.0)?;
        header.flags = (header.flags & !USER_FLAG_MASK) | (user_flags & USER_FLAG_MASK);
        self.write_block(index.0, header, &payload)
    }

    /// Every written record, in ascending sequence order. Does not pin.
    pub fn records(&self) -> StoreResult<Vec<BlockRecord>> {
        let mut records = Vec::with_capacity(self.chains.len());
        for head in self.chains.keys() {
            if self.reserved.contains(head) || self.deferred_free.contains(head) {
                continue;
            }
            records.push(self.load_record(BlockIndex(*head))?);
        }
        records.sort_by_key(|record| (record.sequence, record.index));
        Ok(records)
    }

    /// The store-owned metadata area of the region header.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Replace the metadata area. Not durable until [`sync`](Self::sync).
    pub fn set_metadata(&mut self, metadata: &[u8]) -> StoreResult<()> {
        if metadata.len() > MAX_METADATA_LEN {
            return Err(StoreError::PayloadTooLarge {
                size: metadata.len(),
                reserved: MAX_METADATA_LEN,
            });
        }
        self.metadata = metadata.to_vec();
        self.write_region_header()
    }

    /// Flush every write to the backing medium.
    pub fn sync(&mut self) -> StoreResult<()> {
        self.buffer.sync()
    }

    /// Bytes per block, header included.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Payload bytes one block can hold.
    pub fn payload_capacity(&self) -> usize {
        self.block_size as usize - BLOCK_HEADER_SIZE
    }

    /// Number of data blocks in the region.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of blocks on the free list.
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Number of records (written or reserved) that own blocks.
    pub fn record_count(&self) -> usize {
        self.chains.len()
    }

    /// Blocks a payload of `size` bytes occupies.
    pub fn blocks_for(&self, size: usize) -> usize {
        size.div_ceil(self.payload_capacity()).max(1)
    }

    /// The growth policy in force.
    pub fn growth(&self) -> Growth {
        self.growth
    }

    /// Borrow the backing buffer.
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn block_offset(&self, index: u32) -> u64 {
        (index as u64 + 1) * self.block_size as u64
    }

    fn read_block(&self, index: u32) -> StoreResult<(BlockHeader, Vec<u8>)> {
        if index >= self.capacity {
            return Err(StoreError::InvalidBlock(index));
        }
        let offset = self.block_offset(index);
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.buffer.read_at(offset, &mut raw)?;
        let header = BlockHeader::decode(&raw);
        if !header.is_occupied() {
            return Ok((header, Vec::new()));
        }
        if header.length as usize > self.payload_capacity() {
            return Err(StoreError::corrupt(
                index,
                format!("length {} exceeds block payload", header.length),
            ));
        }
        let mut payload = vec![0u8; header.length as usize];
        self.buffer
            .read_at(offset + BLOCK_HEADER_SIZE as u64, &mut payload)?;
        let actual = header.checksum(&payload);
        if actual != header.crc {
            return Err(StoreError::corrupt(
                index,
                format!("block crc {:#010x} != {actual:#010x}", header.crc),
            ));
        }
        Ok((header, payload))
    }

    fn write_block(&mut self, index: u32, mut header: BlockHeader, payload: &[u8]) -> StoreResult<()> {
        header.crc = header.checksum(payload);
        let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.encode_fields());
        bytes.extend_from_slice(&header.crc.to_le_bytes());
        bytes.extend_from_slice(payload);
        let offset = self.block_offset(index);
        self.buffer.write_at(offset, &bytes)
    }

    fn clear_block(&mut self, index: u32) -> StoreResult<()> {
        let offset = self.block_offset(index);
        self.buffer.write_at(offset, &[0u8; BLOCK_HEADER_SIZE])
    }

    fn load_record(&self, index: BlockIndex) -> StoreResult<BlockRecord> {
        let chain = self
            .chains
            .get(&index.0)
            .ok_or(StoreError::InvalidBlock(index.0))?;
        if self.reserved.contains(&index.0) {
            return Err(StoreError::InvalidBlock(index.0));
        }

        let mut payload = Vec::new();
        let mut sequence = 0;
        let mut user_flags = 0;
        for (position, block) in chain.iter().enumerate() {
            let (header, bytes) = self.read_block(*block)?;
            if !header.is_occupied() || header.is_head() != (position == 0) {
                return Err(StoreError::corrupt(*block, "chain flags do not match record layout"));
            }
            if position == 0 {
                sequence = header.sequence;
                user_flags = header.flags & USER_FLAG_MASK;
            }
            payload.extend_from_slice(&bytes);
        }
        Ok(BlockRecord {
            index,
            sequence,
            user_flags,
            payload,
        })
    }

    fn release_chain(&mut self, head: u32) -> StoreResult<()> {
        let chain = match self.chains.remove(&head) {
            Some(chain) => chain,
            None => return Ok(()),
        };
        let was_reserved = self.reserved.remove(&head);
        for index in &chain {
            if !was_reserved {
                self.clear_block(*index)?;
            }
            self.free.insert(*index);
        }
        Ok(())
    }

    fn write_region_header(&mut self) -> StoreResult<()> {
        let mut bytes = Vec::with_capacity(REGION_HEADER_FIXED + self.metadata.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.capacity.to_le_bytes());
        bytes.extend_from_slice(&(self.metadata.len() as u32).to_le_bytes());
        let mut hasher = Crc32Hasher::new();
        hasher.update(&bytes);
        hasher.update(&self.metadata);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        bytes.extend_from_slice(&self.metadata);
        self.buffer.write_at(0, &bytes)
    }
}

impl<B: BlockBuffer> fmt::Debug for BlockAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("buffer", &self.buffer.name())
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("free", &self.free.len())
            .field("records", &self.chains.len())
            .finish()
    }
}
