// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus durable stores
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The client-side state that lets a relaybus client survive restarts and
// failover without losing or duplicating work:
//
// - [`publish`] keeps outbound messages until the server acknowledges them
//   and replays the rest after a reconnect.
// - [`bookmark`] records which inbound messages each subscription has
//   received and processed.
// - [`recovery`] persists the one bookmark per subscription needed to
//   resume it.
//
// The persistent publish and bookmark stores sit on [`block`], an arena of
// fixed-size, CRC-protected blocks over a [`buffer`] that is either a heap
// vector or a memory-mapped file.
//
// Block regions start with a header block (magic "RBUSBLK1", format
// version, block size, capacity, store metadata, CRC32); see [`block`] for
// the byte layout. The logged bookmark store uses the length-prefixed,
// CRC32-protected framing in [`journal`].
//
// ## Usage
//
// ```no_run
// use relaybus_store::publish::{BlockPublishStore, BlockPublishStoreConfig, PublishStore};
//
// let store = BlockPublishStore::open_file("/tmp/relaybus-publish.blk", BlockPublishStoreConfig::default()).unwrap();
// let sequence = store.store(b"order 42").unwrap();
//
// // After a reconnect, resend everything the server has not acknowledged.
// store.replay(&mut |sequence: u64, payload: &[u8]| {
//     println!("resend {sequence}: {} bytes", payload.len());
//     Ok::<(), relaybus_store::StoreError>(())
// }).unwrap();
//
// store.discard(sequence).unwrap();
// ```

pub mod block;
pub mod bookmark;
pub mod buffer;
pub mod config;
pub mod error;
pub mod journal;
pub mod publish;
pub mod recovery;

pub use block::{BlockAllocator, BlockAllocatorConfig, BlockIndex, Growth};
pub use bookmark::{Bookmark, BookmarkStore, EntryHandle};
pub use buffer::{BlockBuffer, MemoryBuffer, MmapBuffer};
pub use config::{BookmarkStoreConfig, ConflationConfig, PublishStoreConfig, RecoveryPointConfig};
pub use error::{StoreError, StoreResult};
pub use publish::{AckState, PublishStore, StoreReplayer, SyncMode};
pub use recovery::{RecoveryPointAdapter, RecoveryPointSource};
