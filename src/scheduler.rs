//! The worker pool: per-worker deques, the steal loop and fiber execution.

use std::cell::{Cell, UnsafeCell};
use std::hint;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use log::{debug, trace};

use crate::context::Context;
use crate::elastic::Elastic;
use crate::fiber::{FiberRef, FiberStatus};
use crate::stats::{self, Stats, WorkerStats};
use crate::unwind::AbortIfPanic;

/// Payload handed to a fiber when the scheduler switches into it. The value
/// itself is never interpreted by the resumed side; it only has to be
/// distinguishable from a direct save return.
const EXEC_TOKEN: usize = 1;

pub(crate) struct Scheduler {
    stealers: Vec<Stealer<FiberRef>>,
    /// Ready fibers released from outside the pool (the launcher); workers
    /// drain it before attempting random steals.
    injector: Injector<FiberRef>,
    pub(crate) elastic: Elastic,
    pub(crate) stats: Stats,
    /// Set once by the terminal fiber; polled by every worker loop.
    terminator: AtomicBool,
    started: AtomicBool,
    /// Count of workers that have entered their loop, so `start` does not
    /// return (and the chain is not injected) before the pool is real.
    primed: Mutex<usize>,
    all_primed: Condvar,
    steal_attempts: usize,
    stack_size: usize,
}

impl Scheduler {
    /// Bring up `nb_workers` worker threads and wait until every one of
    /// them has entered its scheduler loop.
    pub(crate) fn start(
        nb_workers: usize,
        steal_attempts: usize,
        stack_size: usize,
    ) -> (Arc<Scheduler>, Vec<thread::JoinHandle<()>>) {
        assert!(nb_workers > 0, "a pool needs at least one worker");

        let deques: Vec<_> = (0..nb_workers).map(|_| Deque::new_lifo()).collect();
        let stealers = deques.iter().map(|d| d.stealer()).collect();

        let scheduler = Arc::new(Scheduler {
            stealers,
            injector: Injector::new(),
            elastic: Elastic::new(nb_workers),
            stats: Stats::new(nb_workers),
            terminator: AtomicBool::new(false),
            started: AtomicBool::new(false),
            primed: Mutex::new(0),
            all_primed: Condvar::new(),
            steal_attempts,
            stack_size,
        });

        let mut handles = Vec::with_capacity(nb_workers);
        for (index, deque) in deques.into_iter().enumerate() {
            let sched = scheduler.clone();
            let handle = thread::Builder::new()
                .name(format!("spindle-worker-{}", index))
                .spawn(move || unsafe { WorkerThread::main(sched, index, deque) })
                .unwrap();
            handles.push(handle);
        }

        let mut primed = scheduler.primed.lock().unwrap();
        while *primed < nb_workers {
            primed = scheduler.all_primed.wait(primed).unwrap();
        }
        drop(primed);

        debug!(
            "pool up: {} workers, {} steal attempts per round",
            nb_workers, steal_attempts
        );
        (scheduler, handles)
    }

    pub(crate) fn nb_workers(&self) -> usize {
        self.stealers.len()
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn signal_primed(&self) {
        let mut primed = self.primed.lock().unwrap();
        *primed += 1;
        self.all_primed.notify_one();
    }

    /// Shut the pool down: set the terminator and get every sleeper past
    /// it. Safe to call more than once; the second call is a no-op.
    pub(crate) fn terminate(&self) {
        debug_assert!(
            self.started.load(Ordering::SeqCst),
            "terminal fiber ran before the init fiber"
        );
        self.terminator.store(true, Ordering::SeqCst);
        self.elastic.wake_all();
        trace!("pool terminating");
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminator.load(Ordering::SeqCst)
    }

    /// Release a fiber from a thread that is not part of the pool.
    ///
    /// # Safety
    /// The fiber must outlive the pool's use of it.
    pub(crate) unsafe fn release_external(&self, fiber: FiberRef) {
        if fiber.state().decrement() {
            self.injector.push(fiber);
            self.elastic.wake_after_push(0);
        }
    }
}

pub(crate) struct WorkerThread {
    scheduler: Arc<Scheduler>,
    index: usize,
    deque: Deque<FiberRef>,
    rand: StealRng,
    /// The "home" register frame a fiber exits back into; saved fresh by
    /// every `exec`.
    sched_ctx: UnsafeCell<Context>,
    current_fiber: Cell<Option<FiberRef>>,
}

// The WorkerThread is allocated on the stack of the worker thread on entry
// and stored into this thread local, so it remains valid until the worker
// unwinds. A raw pointer avoids a RefCell.
thread_local! {
    static WORKER_THREAD_STATE: Cell<*const WorkerThread> = Cell::new(ptr::null());
}

impl WorkerThread {
    /// The worker for the current thread, null outside of worker threads.
    ///
    /// Never inlined: a suspended fiber can resume on a different worker
    /// thread, so the result must be re-fetched after every context switch
    /// rather than kept alive across one by the optimizer.
    #[inline(never)]
    pub(crate) fn current() -> *const WorkerThread {
        WORKER_THREAD_STATE.with(|t| t.get())
    }

    unsafe fn set_current(thread: *const WorkerThread) {
        WORKER_THREAD_STATE.with(|t| {
            assert!(t.get().is_null());
            t.set(thread);
        });
    }

    unsafe fn main(scheduler: Arc<Scheduler>, index: usize, deque: Deque<FiberRef>) {
        let worker = WorkerThread {
            scheduler,
            index,
            deque,
            rand: StealRng::for_worker(index),
            sched_ctx: UnsafeCell::new(Context::zeroed()),
            current_fiber: Cell::new(None),
        };

        WorkerThread::set_current(&worker);
        worker.scheduler.signal_primed();
        worker.run();
        trace!("worker {} exits", index);
    }

    unsafe fn run(&self) {
        let abort_guard = AbortIfPanic;
        while !self.scheduler.is_terminated() {
            match self.find_work() {
                Some(fiber) => self.execute(fiber),
                None => {
                    if let Some(fiber) = self.idle() {
                        self.execute(fiber);
                    }
                }
            }
        }
        mem::forget(abort_guard);
    }

    unsafe fn execute(&self, fiber: FiberRef) {
        match self.exec(fiber) {
            FiberStatus::Finish => self.notify(fiber),
            // A paused fiber owns its own revival through its predecessor
            // count; just drop the handle.
            FiberStatus::Pause => {}
        }
    }

    /// Switch into a fiber and report how it gave control back. First entry
    /// maps a stack and arms the trampoline; re-entries resume whatever
    /// context the fiber saved last.
    unsafe fn exec(&self, fiber: FiberRef) -> FiberStatus {
        let state = fiber.state();
        if !state.has_stack() {
            let top = state.alloc_stack(self.scheduler.stack_size);
            Context::init_on_stack(state.ctx_ptr(), top, fiber);
        }
        self.current_fiber.set(Some(fiber));
        let payload = Context::swap(self.sched_ctx.get(), state.ctx_ptr(), EXEC_TOKEN);
        FiberStatus::from_payload(payload)
    }

    /// A finished fiber releases each of its successors; after this the
    /// handle must not be touched again.
    unsafe fn notify(&self, fiber: FiberRef) {
        for succ in fiber.state().take_successors() {
            self.release(succ);
        }
    }

    /// Drop one predecessor of `fiber`; if that made it ready, publish it
    /// on this worker's deque.
    ///
    /// # Safety
    /// The fiber must outlive the pool's use of it.
    pub(crate) unsafe fn release(&self, fiber: FiberRef) {
        if fiber.state().decrement() {
            self.push(fiber);
        }
    }

    /// Publish a ready fiber on the local deque and wake a sleeper if
    /// anyone is parked.
    pub(crate) fn push(&self, fiber: FiberRef) {
        self.deque.push(fiber);
        self.scheduler.elastic.wake_after_push(self.index);
    }

    pub(crate) fn pop(&self) -> Option<FiberRef> {
        self.deque.pop()
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn current_fiber(&self) -> Option<FiberRef> {
        self.current_fiber.get()
    }

    pub(crate) fn sched_ctx_ptr(&self) -> *mut Context {
        self.sched_ctx.get()
    }

    pub(crate) fn stats(&self) -> &WorkerStats {
        self.scheduler.stats.worker(self.index)
    }

    /// Local work first, then the injector, then a round of random steal
    /// attempts sized by the steal policy.
    fn find_work(&self) -> Option<FiberRef> {
        if let Some(fiber) = self.deque.pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.steal_external() {
            return Some(fiber);
        }

        let nb_workers = self.scheduler.nb_workers();
        if nb_workers <= 1 {
            return None;
        }
        for _ in 0..self.scheduler.steal_attempts {
            let victim = self.rand.victim(nb_workers, self.index);
            match self.scheduler.stealers[victim].steal() {
                Steal::Success(fiber) => {
                    stats::bump(&self.stats().nb_steals, 1);
                    trace!("worker {} stole a fiber from worker {}", self.index, victim);
                    return Some(fiber);
                }
                // Empty victims and lost races both just consume an attempt.
                Steal::Empty | Steal::Retry => {}
            }
        }
        None
    }

    fn steal_external(&self) -> Option<FiberRef> {
        loop {
            match self.scheduler.injector.steal() {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// One conclusive sweep over every source: the local deque, the
    /// injector, then each victim until it reports empty. Used to re-verify
    /// emptiness after announcing sleep.
    fn scan_all(&self) -> Option<FiberRef> {
        if let Some(fiber) = self.deque.pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.steal_external() {
            return Some(fiber);
        }
        for victim in 0..self.scheduler.nb_workers() {
            if victim == self.index {
                continue;
            }
            loop {
                match self.scheduler.stealers[victim].steal() {
                    Steal::Success(fiber) => {
                        stats::bump(&self.stats().nb_steals, 1);
                        return Some(fiber);
                    }
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    /// A whole steal round came up dry. Either spin (minimal policy) or go
    /// through the announce / verify / park handshake.
    fn idle(&self) -> Option<FiberRef> {
        if cfg!(feature = "disable-elastic") {
            hint::spin_loop();
            return None;
        }

        let elastic = &self.scheduler.elastic;
        elastic.announce(self.index);
        if let Some(fiber) = self.scan_all() {
            elastic.cancel(self.index);
            return Some(fiber);
        }
        if self.scheduler.is_terminated() {
            elastic.cancel(self.index);
            return None;
        }
        stats::bump(&self.stats().nb_sleeps, 1);
        trace!("worker {} parks", self.index);
        elastic.park(self.index);
        None
    }
}

/// Steal-victim sampler: an [xorshift*] generator seeded from the worker's
/// own index, narrowed to the one question the loop asks.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
struct StealRng {
    state: Cell<u64>,
}

impl StealRng {
    fn for_worker(index: usize) -> StealRng {
        // xorshift needs a nonzero seed; an odd multiplier of index + 1
        // cannot produce zero and decorrelates neighboring workers.
        let seed = (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        StealRng {
            state: Cell::new(seed),
        }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Pick a victim uniformly among the workers other than `me`.
    /// Requires `nb_workers >= 2`.
    fn victim(&self, nb_workers: usize, me: usize) -> usize {
        let mut victim = (self.next() % (nb_workers as u64 - 1)) as usize;
        if victim >= me {
            victim += 1;
        }
        victim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_is_idempotent() {
        let (scheduler, handles) = Scheduler::start(2, 1, 64 * 1024);
        scheduler.mark_started();
        scheduler.terminate();
        scheduler.terminate();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(scheduler.is_terminated());
    }

    #[test]
    fn steal_rng_avoids_self_and_covers_others() {
        let rng = StealRng::for_worker(2);
        let mut seen = [false; 4];
        for _ in 0..1000 {
            let victim = rng.victim(4, 2);
            assert_ne!(victim, 2);
            seen[victim] = true;
        }
        assert!(seen[0] && seen[1] && seen[3]);
    }
}
