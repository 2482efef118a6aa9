//! With sequential elision, the fork tree runs as a plain depth-first
//! in-order execution on whatever thread runs the body.

#![cfg(feature = "sequential-elision")]

use std::sync::Mutex;

use spindle::{fork2, launch, Config};

#[test]
fn elided_forks_run_depth_first() {
    let order = Mutex::new(Vec::new());
    let config = Config {
        nb_workers: 2,
        ..Config::default()
    };
    let report = launch(config, || {}, || {}, || {
        fork2(
            || {
                order.lock().unwrap().push(1);
                fork2(
                    || order.lock().unwrap().push(2),
                    || order.lock().unwrap().push(3),
                );
            },
            || order.lock().unwrap().push(4),
        );
    });
    assert_eq!(order.into_inner().unwrap(), vec![1, 2, 3, 4]);
    // No fibers exist under elision.
    assert_eq!(report.counters.nb_fibers, 0);
}
