// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property tests for server selection and backoff.

use std::time::Duration;

use proptest::prelude::*;
use relaybus_ha::{
    ChooserPolicy, DefaultServerChooser, ExponentialDelayStrategy, HaError,
    ReconnectDelayStrategy, ServerChooser,
};
use url::Url;

const HOSTS: [&str; 4] = ["a", "b", "c", "d"];

#[derive(Debug, Clone)]
enum Op {
    Fail(usize),
    Succeed(usize),
    Remove(usize),
    Add(usize),
    Next,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..HOSTS.len()).prop_map(Op::Fail),
        (0..HOSTS.len()).prop_map(Op::Succeed),
        (0..HOSTS.len()).prop_map(Op::Remove),
        (0..HOSTS.len()).prop_map(Op::Add),
        Just(Op::Next),
    ]
}

fn uri(index: usize) -> String {
    format!("tcp://{}:9007", HOSTS[index])
}

proptest! {
    #[test]
    fn test_next_picks_a_least_failed_live_server(
        ops in prop::collection::vec(arb_op(), 1..60),
        priority in any::<bool>()
    ) {
        let policy = if priority { ChooserPolicy::Priority } else { ChooserPolicy::RoundRobin };
        let mut chooser = DefaultServerChooser::with_servers(policy, (0..HOSTS.len()).map(uri)).unwrap();

        for op in ops {
            match op {
                Op::Fail(i) => chooser.report_failure(&Url::parse(&uri(i)).unwrap(), "refused"),
                Op::Succeed(i) => {
                    let url = Url::parse(&uri(i)).unwrap();
                    chooser.report_success(&url);
                    prop_assert_eq!(chooser.entry(&url).unwrap().failures, 0);
                }
                Op::Remove(i) => chooser.remove(&uri(i)),
                Op::Add(i) => chooser.add(&uri(i)).unwrap(),
                Op::Next => {}
            }

            let live: Vec<_> = chooser.entries().iter().filter(|entry| !entry.removed).cloned().collect();
            match chooser.next() {
                Ok(picked) => {
                    let min = live.iter().map(|entry| entry.failures).min().unwrap();
                    let entry = chooser.entry(&picked).unwrap();
                    prop_assert!(!entry.removed);
                    prop_assert_eq!(entry.failures, min);
                }
                Err(HaError::NoServersAvailable(_)) => prop_assert!(live.is_empty()),
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
    }

    #[test]
    fn test_exponential_backoff_is_monotonic_and_capped(
        base_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        max_ms in 500u64..5_000,
        calls in 1usize..30
    ) {
        let mut strategy = ExponentialDelayStrategy::new(
            Duration::from_millis(base_ms),
            multiplier,
            Duration::from_millis(max_ms),
        );
        let endpoint = Url::parse("tcp://a:9007").unwrap();
        let mut previous = Duration::ZERO;
        for _ in 0..calls {
            let wait = strategy.connect_wait_duration(&endpoint).unwrap();
            prop_assert!(wait >= previous);
            prop_assert!(wait <= Duration::from_millis(max_ms));
            previous = wait;
        }
        strategy.reset();
        prop_assert_eq!(strategy.connect_wait_duration(&endpoint).unwrap(), Duration::from_millis(base_ms));
    }
}
