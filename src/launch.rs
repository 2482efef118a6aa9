//! Launching: configuration, the bootstrap fiber chain and the final
//! timing report.

use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use log::debug;

use crate::fiber::{add_edge, StackFiber};
use crate::scheduler::Scheduler;
use crate::stats::Counters;

/// How many steal attempts a worker makes per round before consulting the
/// elastic policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealPolicy {
    /// One attempt per round.
    Once,
    /// `nb_workers * 100` attempts per round, amortizing the cost of going
    /// to sleep over many failed coupons.
    Coupon,
}

impl Default for StealPolicy {
    fn default() -> StealPolicy {
        StealPolicy::Coupon
    }
}

impl FromStr for StealPolicy {
    type Err = ParseStealPolicyError;

    fn from_str(s: &str) -> Result<StealPolicy, ParseStealPolicyError> {
        match s {
            "once" => Ok(StealPolicy::Once),
            "coupon" => Ok(StealPolicy::Coupon),
            _ => Err(ParseStealPolicyError {
                found: s.to_string(),
            }),
        }
    }
}

/// The value handed to `-steal_policy` was not a known policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStealPolicyError {
    found: String,
}

impl fmt::Display for ParseStealPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown steal policy `{}`, expected `once` or `coupon`",
            self.found
        )
    }
}

impl std::error::Error for ParseStealPolicyError {}

const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Pool parameters. The defaults take every hardware thread and the coupon
/// steal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of worker threads.
    pub nb_workers: usize,
    pub steal_policy: StealPolicy,
    /// Size of each fiber's call stack, in bytes.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            nb_workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            steal_policy: StealPolicy::default(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    fn steal_attempts(&self) -> usize {
        match self.steal_policy {
            StealPolicy::Once => 1,
            StealPolicy::Coupon => self.nb_workers * 100,
        }
    }
}

/// What a `launch` measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    /// Wall-clock seconds spent in `body`.
    pub exectime: f64,
    /// User CPU seconds spent in `body`, summed over workers.
    pub usertime: f64,
    /// System CPU seconds spent in `body`, summed over workers.
    pub systime: f64,
    pub counters: Counters,
}

#[derive(Default)]
struct TimingState {
    start: Option<Instant>,
    ru_before: Option<libc::rusage>,
    elapsed: f64,
    usertime: f64,
    systime: f64,
}

/// Run `pre`, then `body` under full parallelism, then `post`, each exactly
/// once and in that order, and report how long `body` took.
///
/// The three closures are driven by a fiber chain
/// `init -> pre -> timing -> body -> timing -> post -> terminal` injected
/// into a fresh pool of `config.nb_workers` workers; the terminal fiber
/// shuts the pool down. Three lines (`exectime`, `usertime`, `systime`) go
/// to stdout, mirroring the returned `Report`.
pub fn launch<Pre, Post, Body>(config: Config, pre: Pre, post: Post, body: Body) -> Report
where
    Pre: FnOnce() + Send,
    Post: FnOnce() + Send,
    Body: FnOnce() + Send,
{
    debug!(
        "launch: {} workers, {:?} steal policy",
        config.nb_workers, config.steal_policy
    );
    let (scheduler, handles) =
        Scheduler::start(config.nb_workers, config.steal_attempts(), config.stack_size);

    let timing = Mutex::new(TimingState::default());

    let f_init = StackFiber::new(|| scheduler.mark_started());
    let f_pre = StackFiber::new(pre);
    let f_before = StackFiber::new(|| {
        let mut t = timing.lock().unwrap();
        t.ru_before = Some(rusage_self());
        t.start = Some(Instant::now());
    });
    let f_body = StackFiber::new(body);
    let f_after = StackFiber::new(|| {
        let mut t = timing.lock().unwrap();
        let start = t.start.expect("timing fibers ran out of order");
        let before = t.ru_before.take().expect("timing fibers ran out of order");
        let after = rusage_self();
        t.elapsed = start.elapsed().as_secs_f64();
        t.usertime = tv_seconds(after.ru_utime) - tv_seconds(before.ru_utime);
        t.systime = tv_seconds(after.ru_stime) - tv_seconds(before.ru_stime);
    });
    let f_post = StackFiber::new(post);
    let f_term = StackFiber::new(|| scheduler.terminate());

    // The chain fibers live on this frame; joining the workers below keeps
    // every published handle inside its lifetime.
    unsafe {
        let chain = [
            f_init.as_fiber_ref(),
            f_pre.as_fiber_ref(),
            f_before.as_fiber_ref(),
            f_body.as_fiber_ref(),
            f_after.as_fiber_ref(),
            f_post.as_fiber_ref(),
            f_term.as_fiber_ref(),
        ];
        for pair in chain.windows(2) {
            add_edge(pair[0], pair[1]);
        }
        for fiber in chain.iter() {
            scheduler.release_external(*fiber);
        }
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let report = {
        let t = timing.lock().unwrap();
        Report {
            exectime: t.elapsed,
            usertime: t.usertime,
            systime: t.systime,
            counters: scheduler.stats.reduce(),
        }
    };

    println!("exectime {:.3}", report.exectime);
    println!("usertime {:.3}", report.usertime);
    println!("systime {:.3}", report.systime);

    #[cfg(feature = "stats")]
    {
        println!("nb_fibers {}", report.counters.nb_fibers);
        println!("nb_steals {}", report.counters.nb_steals);
        println!("nb_sleeps {}", report.counters.nb_sleeps);
    }

    report
}

fn rusage_self() -> libc::rusage {
    unsafe {
        let mut ru: libc::rusage = mem::zeroed();
        let rc = libc::getrusage(libc::RUSAGE_SELF, &mut ru);
        assert_eq!(rc, 0, "getrusage failed");
        ru
    }
}

fn tv_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}
