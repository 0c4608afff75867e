// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores - Journal record framing
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Append-only journal used by the logged bookmark store. Each record is
// length-prefixed and CRC32-protected so that a torn write at the tail of
// the file can be detected and cut off on reopen.
//
// On-disk binary format (all integers little-endian):
//   [4 bytes: record_length (u32)]  -- length of everything after this field
//   [4 bytes: crc32 checksum]       -- CRC32 of all bytes after this field
//   [1 byte:  op]                   -- 0=Log, 1=Discard, 2=Purge
//   [8 bytes: timestamp (i64)]      -- Unix milliseconds UTC
//   [8 bytes: entry (u64)]          -- arrival sequence within the subscription
//   [4 bytes: subscription_len (u32)]
//   [N bytes: subscription]
//   [4 bytes: bookmark_len (u32)]
//   [M bytes: bookmark]

use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Largest record a reader accepts. Anything larger is treated as garbage.
pub const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

const FIXED_FIELDS_SIZE: usize = 1 + 8 + 8;

/// What a journal record does to the bookmark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// A bookmark was delivered and logged.
    Log = 0,
    /// Everything up to `entry` was discarded.
    Discard = 1,
    /// The subscription (or, with an empty subscription, everything) was
    /// purged.
    Purge = 2,
}

impl JournalOp {
    /// Decode a single byte.
    pub fn from_byte(byte: u8) -> StoreResult<Self> {
        match byte {
            0 => Ok(Self::Log),
            1 => Ok(Self::Discard),
            2 => Ok(Self::Purge),
            other => Err(StoreError::corrupt(0, format!("unknown journal op {other}"))),
        }
    }

    /// Encode as a single byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub op: JournalOp,
    pub timestamp: DateTime<Utc>,
    pub subscription: String,
    pub entry: u64,
    pub bookmark: String,
}

impl JournalRecord {
    /// A record stamped with the current time.
    pub fn new(op: JournalOp, subscription: &str, entry: u64, bookmark: &str) -> Self {
        Self {
            op,
            timestamp: Utc::now(),
            subscription: subscription.to_string(),
            entry,
            bookmark: bookmark.to_string(),
        }
    }

    /// Encode including the length prefix and CRC.
    pub fn serialize(&self) -> Vec<u8> {
        let subscription = self.subscription.as_bytes();
        let bookmark = self.bookmark.as_bytes();
        let mut inner =
            Vec::with_capacity(FIXED_FIELDS_SIZE + 8 + subscription.len() + bookmark.len());
        inner.push(self.op.to_byte());
        inner.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        inner.extend_from_slice(&self.entry.to_le_bytes());
        inner.extend_from_slice(&(subscription.len() as u32).to_le_bytes());
        inner.extend_from_slice(subscription);
        inner.extend_from_slice(&(bookmark.len() as u32).to_le_bytes());
        inner.extend_from_slice(bookmark);

        let crc = compute_crc32(&inner);
        let record_length = (4 + inner.len()) as u32;
        let mut buffer = Vec::with_capacity(4 + record_length as usize);
        buffer.extend_from_slice(&record_length.to_le_bytes());
        buffer.extend_from_slice(&crc.to_le_bytes());
        buffer.extend_from_slice(&inner);
        buffer
    }

    /// Decode from the bytes after the length prefix (CRC first).
    pub fn deserialize(data: &[u8], ordinal: u32) -> StoreResult<Self> {
        if data.len() < 4 {
            return Err(StoreError::corrupt(ordinal, "record shorter than its checksum"));
        }
        let stored_crc = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let inner = &data[4..];
        let computed_crc = compute_crc32(inner);
        if stored_crc != computed_crc {
            return Err(StoreError::corrupt(
                ordinal,
                format!("journal crc {stored_crc:#010x} != {computed_crc:#010x}"),
            ));
        }

        let mut cursor = Cursor { data: inner, offset: 0, ordinal };
        let op = JournalOp::from_byte(cursor.take(1)?[0])?;
        let timestamp_millis = i64::from_le_bytes(cursor.array::<8>()?);
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_millis)
            .single()
            .unwrap_or_else(Utc::now);
        let entry = u64::from_le_bytes(cursor.array::<8>()?);
        let subscription = cursor.string()?;
        let bookmark = cursor.string()?;
        Ok(Self {
            op,
            timestamp,
            subscription,
            entry,
            bookmark,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
    ordinal: u32,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StoreError::corrupt(self.ordinal, "record body truncated"))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> StoreResult<String> {
        let len = u32::from_le_bytes(self.array::<4>()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::corrupt(self.ordinal, "string field is not UTF-8"))
    }
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub struct JournalScan {
    /// Every record that passed validation, in file order.
    pub records: Vec<JournalRecord>,
    /// Byte length of the well-formed prefix. Anything after it is a torn
    /// tail and should be truncated before appending.
    pub valid_len: u64,
    /// Records skipped because they failed validation.
    pub skipped: usize,
}

/// Scan a journal image. Corrupted records in the middle are skipped with
/// a warning; a truncated record at the end stops the scan.
pub fn scan(data: &[u8]) -> JournalScan {
    let mut scan = JournalScan::default();
    let mut offset = 0usize;
    let mut ordinal = 0u32;

    while offset + 4 <= data.len() {
        let record_length = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if record_length == 0 || record_length > MAX_RECORD_SIZE {
            warn!(offset, record_length, "Journal record declares implausible length, stopping");
            break;
        }
        let end = offset + 4 + record_length as usize;
        if end > data.len() {
            debug!(offset, record_length, "Truncated journal record at tail (expected after crash)");
            break;
        }
        match JournalRecord::deserialize(&data[offset + 4..end], ordinal) {
            Ok(record) => scan.records.push(record),
            Err(error) => {
                warn!(%error, offset, "Skipping unreadable journal record");
                scan.skipped += 1;
            }
        }
        offset = end;
        scan.valid_len = offset as u64;
        ordinal = ordinal.saturating_add(1);
    }
    scan
}

/// CRC32 (IEEE) over `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(entry: u64) -> JournalRecord {
        JournalRecord::new(JournalOp::Log, "orders", entry, &format!("bm-{entry}"))
    }

    #[test]
    fn test_serialize_deserialize() {
        let record = sample(7);
        let bytes = record.serialize();
        let recovered = JournalRecord::deserialize(&bytes[4..], 0).unwrap();
        assert_eq!(recovered.op, JournalOp::Log);
        assert_eq!(recovered.entry, 7);
        assert_eq!(recovered.subscription, "orders");
        assert_eq!(recovered.bookmark, "bm-7");
        assert_eq!(
            recovered.timestamp.timestamp_millis(),
            record.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut bytes = sample(1).serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let error = JournalRecord::deserialize(&bytes[4..], 3).unwrap_err();
        assert!(matches!(error, StoreError::StoreCorrupt { index: 3, .. }));
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let mut data = Vec::new();
        data.extend(sample(1).serialize());
        data.extend(sample(2).serialize());
        let intact = data.len() as u64;
        let third = sample(3).serialize();
        data.extend_from_slice(&third[..third.len() / 2]);

        let scan = scan(&data);
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.valid_len, intact);
    }

    #[test]
    fn test_scan_skips_corrupt_middle_record() {
        let mut data = Vec::new();
        data.extend(sample(1).serialize());
        let mut bad = sample(2).serialize();
        let last = bad.len() - 1;
        bad[last] ^= 0x55;
        data.extend(bad);
        data.extend(sample(3).serialize());

        let scan = scan(&data);
        let entries: Vec<u64> = scan.records.iter().map(|r| r.entry).collect();
        assert_eq!(entries, vec![1, 3]);
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.valid_len, data.len() as u64);
    }
}
