//! The bootstrap chain: ordering of pre/body/post and the timing report.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use spindle::{launch, Config};

#[test]
fn chain_runs_pre_body_post_in_order() {
    let log = Mutex::new(String::new());
    let config = Config {
        nb_workers: 16,
        ..Config::default()
    };
    launch(
        config,
        || log.lock().unwrap().push('A'),
        || log.lock().unwrap().push('C'),
        || log.lock().unwrap().push('B'),
    );
    assert_eq!(log.into_inner().unwrap(), "ABC");
}

#[test]
fn body_time_is_measured() {
    let config = Config {
        nb_workers: 2,
        ..Config::default()
    };
    let report = launch(config, || {}, || {}, || {
        thread::sleep(Duration::from_millis(50));
    });
    assert!(
        report.exectime >= 0.045,
        "a 50ms body measured {}s",
        report.exectime
    );
    assert!(report.usertime >= 0.0);
    assert!(report.systime >= 0.0);
}

#[test]
fn pre_and_post_run_outside_the_measured_window() {
    let config = Config {
        nb_workers: 2,
        ..Config::default()
    };
    let report = launch(
        config,
        || thread::sleep(Duration::from_millis(40)),
        || thread::sleep(Duration::from_millis(40)),
        || {},
    );
    assert!(
        report.exectime < 0.040,
        "pre/post leaked into the body window: {}s",
        report.exectime
    );
}
