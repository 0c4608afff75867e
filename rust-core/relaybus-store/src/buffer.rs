// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Backing buffers for the block allocator
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `BlockBuffer` is a flat, growable byte region. The block allocator lays
// its header and fixed-size blocks out on top of one and never hands raw
// addresses to callers, so a buffer is free to reallocate (heap) or remap
// (mmap) when it grows.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// A flat byte region that the block allocator builds on.
pub trait BlockBuffer: Send {
    /// Current size of the region in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the region holds no bytes yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the region cannot be written or grown.
    fn is_read_only(&self) -> bool;

    /// Extend the region to `new_len` bytes. New bytes are zeroed and all
    /// existing bytes keep their offsets. Shrinking is not supported.
    fn grow(&mut self, new_len: u64) -> StoreResult<()>;

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()>;

    /// Copy `data` into the region starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Make every previous `write_at` durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

fn out_of_range(offset: u64, len: usize, size: u64) -> StoreError {
    StoreError::Io(IoError::new(
        ErrorKind::UnexpectedEof,
        format!("range {offset}+{len} outside region of {size} bytes"),
    ))
}

fn checked_range(offset: u64, len: usize, size: u64) -> StoreResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len as u64)
        .filter(|end| *end <= size)
        .ok_or_else(|| out_of_range(offset, len, size))?;
    Ok(offset as usize..end as usize)
}

// ---------------------------------------------------------------------------
// MemoryBuffer
// ---------------------------------------------------------------------------

/// A heap-backed region. Contents die with the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryBuffer {
    bytes: Vec<u8>,
}

impl MemoryBuffer {
    /// Create an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes, e.g. a copy of another region taken in a test.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutably borrow the raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl BlockBuffer for MemoryBuffer {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn grow(&mut self, new_len: u64) -> StoreResult<()> {
        if new_len > self.bytes.len() as u64 {
            self.bytes.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let range = checked_range(offset, buf.len(), self.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let range = checked_range(offset, data.len(), self.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// MmapBuffer
// ---------------------------------------------------------------------------

enum Mapping {
    /// Zero-length files cannot be mapped on every platform.
    Unmapped,
    Writable(MmapMut),
    ReadOnly(Mmap),
}

/// A region backed by a memory-mapped file.
///
/// Growth extends the file with `set_len` and remaps it. Mapped bytes are
/// written back by `sync`, which is what makes a `store()` on a persistent
/// publish store durable before it returns.
pub struct MmapBuffer {
    path: PathBuf,
    file: File,
    mapping: Mapping,
    len: u64,
}

impl MmapBuffer {
    /// Open (or create) a file for read/write mapping. Parent directories
    /// are created as needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!(dir = %parent.display(), "Created store directory");
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let mapping = if len == 0 {
            Mapping::Unmapped
        } else {
            // SAFETY: the file stays open for the lifetime of the mapping and
            // this process is its only writer; concurrent external truncation
            // is outside the store's contract.
            Mapping::Writable(unsafe { MmapMut::map_mut(&file)? })
        };
        debug!(path = %path.display(), len, "Mapped store file");
        Ok(Self {
            path,
            file,
            mapping,
            len,
        })
    }

    /// Open an existing file for inspection. Every mutation fails with
    /// [`StoreError::ReadOnly`] and allocation on top of it reports
    /// [`StoreError::StoreFull`].
    pub fn open_read_only(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mapping = if len == 0 {
            Mapping::Unmapped
        } else {
            // SAFETY: see `open`.
            Mapping::ReadOnly(unsafe { Mmap::map(&file)? })
        };
        Ok(Self {
            path,
            file,
            mapping,
            len,
        })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Unmapped => &[],
            Mapping::Writable(map) => &map[..],
            Mapping::ReadOnly(map) => &map[..],
        }
    }
}

impl std::fmt::Debug for MmapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapBuffer")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl BlockBuffer for MmapBuffer {
    fn len(&self) -> u64 {
        self.len
    }

    fn is_read_only(&self) -> bool {
        matches!(self.mapping, Mapping::ReadOnly(_))
    }

    fn grow(&mut self, new_len: u64) -> StoreResult<()> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        if new_len <= self.len {
            return Ok(());
        }
        if let Mapping::Writable(map) = &self.mapping {
            map.flush()?;
        }
        self.mapping = Mapping::Unmapped;
        self.file.set_len(new_len)?;
        // SAFETY: see `open`; the previous mapping was dropped above.
        self.mapping = Mapping::Writable(unsafe { MmapMut::map_mut(&self.file)? });
        debug!(path = %self.path.display(), old_len = self.len, new_len, "Remapped store file");
        self.len = new_len;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let range = checked_range(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.bytes()[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let range = checked_range(offset, data.len(), self.len)?;
        match &mut self.mapping {
            Mapping::Writable(map) => {
                map[range].copy_from_slice(data);
                Ok(())
            }
            Mapping::ReadOnly(_) => Err(StoreError::ReadOnly),
            Mapping::Unmapped => Err(out_of_range(offset, data.len(), 0)),
        }
    }

    fn sync(&mut self) -> StoreResult<()> {
        match &self.mapping {
            Mapping::Writable(map) => map.flush()?,
            Mapping::ReadOnly(_) | Mapping::Unmapped => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mmap"
    }
}
