//! Binary fork/join on top of the fiber graph.
//!
//! `fork2` suspends the running fiber behind its two children and arranges
//! for the continuation after the call to run exactly once when both have
//! finished, wherever that happens. The fast path never allocates: the left
//! child always continues on the parent's stack, and if the right child is
//! still in the local deque after the left one ran, it reuses that stack
//! too. Only a stolen child is entered through the trampoline on a stack of
//! its own.
//!
//! Every segment transition goes back through the worker loop, so finish
//! notifications happen in exactly one place, and the status a fiber
//! reports travels on the switch payload rather than through shared memory
//! (a thief may already be running the continuation by the time the old
//! worker regains control).

use std::mem;

#[cfg(not(feature = "sequential-elision"))]
use log::trace;

use crate::context::Context;
#[cfg(not(feature = "sequential-elision"))]
use crate::context::Resume;
use crate::fiber::{FiberRef, FiberStatus};
#[cfg(not(feature = "sequential-elision"))]
use crate::fiber::{add_edge, StackFiber};
use crate::scheduler::WorkerThread;
#[cfg(not(feature = "sequential-elision"))]
use crate::stats;
use crate::unwind::AbortIfPanic;

/// Leave the running fiber, reporting `status` for it to the current
/// worker's loop.
pub(crate) unsafe fn exit_to_scheduler(status: FiberStatus) -> ! {
    let worker = WorkerThread::current();
    debug_assert!(!worker.is_null());
    Context::restore((*worker).sched_ctx_ptr(), status.payload())
}

/// First entry into a fiber with a stack of its own; invoked by the context
/// trampoline. `fiber` points at the handle planted on the new stack.
#[no_mangle]
unsafe extern "C" fn spindle_fiber_entry(fiber: *const FiberRef) -> ! {
    let fiber = *fiber;
    {
        // A panic in the body has no scheduler frame to unwind into.
        let guard = AbortIfPanic;
        fiber.run();
        mem::forget(guard);
    }
    exit_to_scheduler(FiberStatus::Finish)
}

/// Run `f1` and `f2`, potentially in parallel, returning when both are
/// done. Must be called from inside a fiber (the body of `launch`, or a
/// closure already running under `fork2`).
#[cfg(feature = "sequential-elision")]
pub fn fork2<F1, F2>(f1: F1, f2: F2)
where
    F1: FnOnce() + Send,
    F2: FnOnce() + Send,
{
    f1();
    f2();
}

/// Run `f1` and `f2`, potentially in parallel, returning when both are
/// done. Must be called from inside a fiber (the body of `launch`, or a
/// closure already running under `fork2`).
#[cfg(not(feature = "sequential-elision"))]
pub fn fork2<F1, F2>(f1: F1, f2: F2)
where
    F1: FnOnce() + Send,
    F2: FnOnce() + Send,
{
    unsafe {
        let worker = WorkerThread::current();
        assert!(!worker.is_null(), "fork2 called outside of a running fiber");
        let worker = &*worker;
        let parent = worker
            .current_fiber()
            .expect("fork2 called outside of a running fiber");
        stats::bump(&worker.stats().nb_fibers, 2);

        let left = StackFiber::new(f1);
        let right = StackFiber::new(f2);
        let left_ref = left.as_fiber_ref();
        let right_ref = right.as_fiber_ref();

        add_edge(left_ref, parent);
        add_edge(right_ref, parent);

        // The join continuation must exist before either child is visible
        // to a thief; a child finishing early can then only find a
        // fully-formed context to resume.
        if let Resume::Switched(_) = Context::save(parent.state().ctx_ptr()) {
            // Both children have finished and the last one released us; we
            // may be on any worker now.
            return;
        }

        // The left child continues on this stack. Seed its resume point
        // before it is published, for the same reason as the capture above.
        left.state().adopt_caller_stack();
        if let Resume::Direct = Context::save(left.state().ctx_ptr()) {
            // Right below left, so the owner pops left first and thieves
            // take right first.
            worker.release(right_ref);
            worker.release(left_ref);
            exit_to_scheduler(FiberStatus::Pause);
        }

        // Left segment: some worker's exec landed on the seed above, and
        // this frame is now running as the left child. Thread locals from
        // before the switch are stale; the worker is re-fetched below.
        left_ref.run();

        let worker = &*WorkerThread::current();
        match worker.pop() {
            Some(popped) if FiberRef::same_fiber(popped, right_ref) => {
                // The right child is still ours; it can reuse this stack
                // the same way the left one did.
                right.state().adopt_caller_stack();
                if let Resume::Direct = Context::save(right.state().ctx_ptr()) {
                    // Republish and bounce through the loop so the left
                    // child is notified before the right one runs.
                    worker.push(right_ref);
                    exit_to_scheduler(FiberStatus::Finish);
                }

                // Right segment.
                right_ref.run();

                // Reporting the right child finished releases the parent;
                // the worker that pops it resumes us right here.
                let worker = &*WorkerThread::current();
                Context::swap(
                    parent.state().ctx_ptr(),
                    worker.sched_ctx_ptr(),
                    FiberStatus::Finish.payload(),
                );
            }
            popped => {
                // The right child was stolen, or this continuation migrated
                // to a worker whose deque holds unrelated fibers. Either
                // way it runs as an ordinary fiber elsewhere; the last
                // child to finish resumes the captured continuation.
                if let Some(foreign) = popped {
                    worker.push(foreign);
                }
                trace!("worker {} lost a right child to a thief", worker.index());
                exit_to_scheduler(FiberStatus::Finish);
            }
        }
    }
}
