//! Elastic sleeping: workers park while the pool is quiet and wake when
//! leaves appear.

#![cfg(not(any(feature = "disable-elastic", feature = "sequential-elision")))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use spindle::{fork2, launch, Config};

#[test]
fn parked_workers_wake_for_new_leaves() {
    let _ = env_logger::builder().is_test(true).try_init();
    let leaves = AtomicUsize::new(0);
    let config = Config {
        nb_workers: 4,
        ..Config::default()
    };
    let report = launch(config, || {}, || {}, || {
        // Let the other three workers run dry and park before any leaf
        // exists.
        thread::sleep(Duration::from_millis(10));
        fork2(
            || {
                fork2(
                    || {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    },
                    || {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    },
                );
            },
            || {
                fork2(
                    || {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    },
                    || {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    },
                );
            },
        );
    });

    assert_eq!(leaves.load(Ordering::Relaxed), 4);
    assert!(
        report.counters.nb_sleeps >= 3,
        "expected the three idle workers to park, saw {} sleeps",
        report.counters.nb_sleeps
    );
}
