// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property-based tests for the publish and bookmark stores

use proptest::prelude::*;
use relaybus_store::bookmark::{BlockBookmarkStore, MemoryBookmarkStore};
use relaybus_store::publish::{
    BlockPublishStore, BlockPublishStoreConfig, CollectingReplayer, HybridFlushPolicy,
    HybridPublishStore, MemoryPublishStore,
};
use relaybus_store::{Bookmark, BookmarkStore, PublishStore};

/// One store of each publish variant, all in memory.
fn publish_stores(max_buffered: usize) -> Vec<Box<dyn PublishStore>> {
    let config = BlockPublishStoreConfig {
        reclaim_batch: 4,
        ..BlockPublishStoreConfig::default()
    };
    let durable = BlockPublishStore::in_memory(config.clone()).unwrap();
    vec![
        Box::new(MemoryPublishStore::new()),
        Box::new(BlockPublishStore::in_memory(config).unwrap()),
        Box::new(HybridPublishStore::new(
            durable,
            HybridFlushPolicy {
                max_buffered,
                interval: None,
            },
        )),
    ]
}

fn pending(store: &dyn PublishStore) -> Vec<u64> {
    let mut collector = CollectingReplayer::default();
    store.replay(&mut collector).unwrap();
    collector.records.into_iter().map(|(seq, _)| seq).collect()
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..600)
}

/// Delivered bookmarks and, per step, whether to discard the latest one.
fn arb_deliveries() -> impl Strategy<Value = Vec<(String, bool)>> {
    prop::collection::vec(("[0-9]{1,3}\\|[0-9]{1,4}", any::<bool>()), 1..40)
}

proptest! {
    #[test]
    fn test_sequences_strictly_increase_without_gaps(
        payloads in prop::collection::vec(arb_payload(), 1..30),
        max_buffered in 1usize..8
    ) {
        for store in publish_stores(max_buffered) {
            let mut sequences = Vec::new();
            for payload in &payloads {
                sequences.push(store.store(payload).unwrap());
            }
            let expected: Vec<u64> = (1..=payloads.len() as u64).collect();
            prop_assert_eq!(&sequences, &expected, "store {}", store.name());
        }
    }

    #[test]
    fn test_replay_is_exactly_the_undiscarded_set(
        count in 1u64..40,
        discards in prop::collection::vec(1u64..60, 0..40),
        max_buffered in 1usize..8
    ) {
        for store in publish_stores(max_buffered) {
            for i in 0..count {
                store.store(&i.to_le_bytes()).unwrap();
            }
            for sequence in &discards {
                store.discard(*sequence).unwrap();
            }
            let expected: Vec<u64> = (1..=count).filter(|seq| !discards.contains(seq)).collect();
            prop_assert_eq!(pending(store.as_ref()), expected.clone(), "store {}", store.name());
            prop_assert_eq!(store.unpersisted_count(), expected.len());
            prop_assert_eq!(store.lowest_unpersisted(), expected.first().copied());
        }
    }

    #[test]
    fn test_discard_twice_equals_discard_once(
        count in 1u64..20,
        target in 1u64..20
    ) {
        for store in publish_stores(3) {
            for _ in 0..count {
                store.store(b"p").unwrap();
            }
            store.discard(target).unwrap();
            let once = pending(store.as_ref());
            let persisted_once = store.last_persisted();
            store.discard(target).unwrap();
            prop_assert_eq!(pending(store.as_ref()), once);
            prop_assert_eq!(store.last_persisted(), persisted_once);
        }
    }

    #[test]
    fn test_most_recent_bookmark_never_moves_backwards(deliveries in arb_deliveries()) {
        let stores: Vec<Box<dyn BookmarkStore>> = vec![
            Box::new(MemoryBookmarkStore::new()),
            Box::new(BlockBookmarkStore::ring(256).unwrap()),
        ];
        for store in stores {
            let mut discarded_entry = 0u64;
            for (value, discard) in &deliveries {
                let handle = store.log("sub", &Bookmark::from(value.as_str())).unwrap();
                if *discard {
                    store.discard(&handle).unwrap();
                    discarded_entry = discarded_entry.max(handle.entry());
                }
                // The resume point is the bookmark of the highest discarded entry.
                if discarded_entry > 0 {
                    let most_recent = store.get_most_recent("sub").unwrap();
                    let entry = store.log("sub", &most_recent).unwrap().entry();
                    prop_assert_eq!(entry, discarded_entry, "store {}", store.name());
                }
            }
        }
    }
}
