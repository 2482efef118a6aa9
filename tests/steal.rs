//! Steal-path scenarios: a right child that must be stolen, and a
//! single-worker run where nothing can be.

#![cfg(not(feature = "sequential-elision"))]

use std::time::{Duration, Instant};

use spindle::{fork2, launch, Config, StealPolicy};

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn stack_marker() -> usize {
    let probe = 0u8;
    &probe as *const u8 as usize
}

#[test]
fn right_child_is_stolen_under_load() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut nb_fibers = 0;
    let mut nb_steals = 0;
    for _ in 0..1000 {
        let config = Config {
            nb_workers: 2,
            steal_policy: StealPolicy::Coupon,
            ..Config::default()
        };
        let report = launch(config, || {}, || {}, || {
            // The left child pins this worker long enough that the right
            // one is picked up by the other.
            fork2(|| spin_for(Duration::from_millis(1)), || {});
        });
        nb_fibers += report.counters.nb_fibers;
        nb_steals += report.counters.nb_steals;
    }
    assert_eq!(nb_fibers, 2000);
    assert!(
        nb_steals >= 900,
        "expected at least 900 steals over 1000 runs, saw {}",
        nb_steals
    );
}

#[test]
fn no_steals_on_a_single_worker() {
    let config = Config {
        nb_workers: 1,
        steal_policy: StealPolicy::Once,
        ..Config::default()
    };
    let (mut parent_sp, mut left_sp, mut right_sp) = (0usize, 0usize, 0usize);
    let report = launch(config, || {}, || {}, || {
        parent_sp = stack_marker();
        fork2(|| left_sp = stack_marker(), || right_sp = stack_marker());
    });

    assert_eq!(report.counters.nb_steals, 0);
    assert_eq!(report.counters.nb_fibers, 2);

    // With nobody to steal them, both children ran on the parent's stack:
    // all three markers sit within one fiber stack of each other.
    let window = 256 * 1024;
    assert!(
        parent_sp.abs_diff(left_sp) < window,
        "left child left the parent's stack: {:#x} vs {:#x}",
        left_sp,
        parent_sp
    );
    assert!(
        parent_sp.abs_diff(right_sp) < window,
        "right child left the parent's stack: {:#x} vs {:#x}",
        right_sp,
        parent_sp
    );
}
