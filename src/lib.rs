//! #### Spindle
//! A light-weight parallel fork-join runtime with automatic load balancing.
//! Programs express parallelism by recursively forking pairs of closures
//! with [`fork2`]; the runtime spreads the resulting fibers over a fixed
//! pool of workers with randomized work stealing, parks workers that run
//! dry, and wakes them as load returns.
//!
//! The unusual part is the fast path: an unstolen child runs directly on
//! its parent's call stack via a small context-switch primitive, so a fork
//! whose children never leave the worker costs a couple of register saves
//! rather than a heap allocation and a queue round-trip.
//!
//! ```no_run
//! fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let (mut a, mut b) = (0, 0);
//!     spindle::fork2(|| a = fib(n - 1), || b = fib(n - 2));
//!     a + b
//! }
//!
//! let mut result = 0;
//! spindle::launch(spindle::Config::default(), || {}, || {}, || {
//!     result = fib(30);
//! });
//! assert_eq!(result, 832040);
//! ```
//!
//! #### Thanks
//! The worker pool plumbing follows the shape popularized by
//! [rayon](https://github.com/rayon-rs/rayon); the scheduling discipline
//! (fiber graphs, elastic sleeping, the run-on-parent-stack fork) follows
//! the native fork-join runtimes of the research scheduling literature.

mod context;
mod elastic;
mod fiber;
mod forkjoin;
mod launch;
mod scheduler;
mod stats;
mod unwind;

pub use self::forkjoin::fork2;
pub use self::launch::{launch, Config, ParseStealPolicyError, Report, StealPolicy};
pub use self::stats::Counters;
