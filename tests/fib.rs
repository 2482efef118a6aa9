//! Naive doubly-recursive Fibonacci: deep fork nesting and stack reuse.

use spindle::{fork2, launch, Config};

fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let (mut a, mut b) = (0, 0);
    fork2(|| a = fib(n - 1), || b = fib(n - 2));
    a + b
}

#[test]
fn fib_30_under_full_parallelism() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config {
        nb_workers: 4,
        ..Config::default()
    };
    let mut result = 0;
    launch(config, || {}, || {}, || result = fib(30));
    assert_eq!(result, 832_040);
}

#[test]
fn fib_20_on_one_worker() {
    let config = Config {
        nb_workers: 1,
        ..Config::default()
    };
    let mut result = 0;
    launch(config, || {}, || {}, || result = fib(20));
    assert_eq!(result, 6_765);
}
