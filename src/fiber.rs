//! Fibers: the nodes of the runtime's dataflow graph.
//!
//! A fiber carries a predecessor count and a successor list. Wiring an edge
//! bumps the successor's count; finishing a fiber decrements every
//! successor, and whichever decrement brings a count to zero schedules that
//! fiber. Counts start at one so that a freshly wired fiber still needs one
//! explicit release before it can run.
//!
//! Fibers are published between workers as `FiberRef`, a type-erased raw
//! handle in the same mold as a stack job reference: a thin pointer plus the
//! monomorphized runner for the concrete closure type. The objects
//! themselves usually live on the stack frame of `fork2` or `launch`; the
//! release/notify protocol guarantees the frame outlives every use.

use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::context::Context;

/// What a fiber reported when it last gave control back to a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberStatus {
    /// Ran to completion; successors must be notified.
    Finish,
    /// Suspended awaiting its children; it revives itself through its
    /// predecessor count.
    Pause,
}

impl FiberStatus {
    /// The status rides on the context-switch payload between a fiber and
    /// the scheduler context, so a worker never has to read it out of
    /// shared fiber memory that another worker might already be mutating.
    pub(crate) fn payload(self) -> usize {
        match self {
            FiberStatus::Finish => 1,
            FiberStatus::Pause => 2,
        }
    }

    pub(crate) fn from_payload(val: usize) -> FiberStatus {
        match val {
            1 => FiberStatus::Finish,
            2 => FiberStatus::Pause,
            v => panic!("corrupt scheduler switch payload: {}", v),
        }
    }
}

/// Where a fiber's call stack comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackSlot {
    /// Never entered; a stack is mapped on first execution.
    None,
    /// Runs on a stack owned by somebody else (its fork2 parent) and must
    /// not unmap it.
    NotOwned,
    /// Owns the mapping and unmaps it exactly once, on drop.
    Owned { base: *mut u8, len: usize },
}

/// The scheduling half of every fiber: edge counters, successor list, saved
/// CPU context and stack slot.
pub(crate) struct FiberState {
    incounter: AtomicUsize,
    /// Written only while the graph is being wired (before release) or by
    /// the single worker finishing the fiber; never concurrently.
    successors: UnsafeCell<SmallVec<[FiberRef; 2]>>,
    /// Written only by the worker currently executing the fiber.
    ctx: UnsafeCell<Context>,
    stack: Cell<StackSlot>,
}

impl FiberState {
    pub(crate) fn new() -> FiberState {
        FiberState {
            incounter: AtomicUsize::new(1),
            successors: UnsafeCell::new(SmallVec::new()),
            ctx: UnsafeCell::new(Context::zeroed()),
            stack: Cell::new(StackSlot::None),
        }
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn has_stack(&self) -> bool {
        self.stack.get() != StackSlot::None
    }

    /// Mark this fiber as continuing on its parent's stack.
    pub(crate) fn adopt_caller_stack(&self) {
        debug_assert_eq!(self.stack.get(), StackSlot::None);
        self.stack.set(StackSlot::NotOwned);
    }

    /// Map a fresh stack (with a guard page at the low end) for this fiber
    /// and return its top. Aborts on exhaustion; the runtime does not
    /// degrade.
    pub(crate) fn alloc_stack(&self, len: usize) -> *mut u8 {
        debug_assert_eq!(self.stack.get(), StackSlot::None);
        let (base, total) = map_stack(len);
        self.stack.set(StackSlot::Owned { base, len: total });
        unsafe { base.add(total) }
    }

    /// Drop one predecessor; true when the count hit zero and the fiber is
    /// ready to run.
    pub(crate) fn decrement(&self) -> bool {
        let prev = self.incounter.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "fiber released more often than it has predecessors");
        prev == 1
    }

    fn increment(&self) {
        self.incounter.fetch_add(1, Ordering::Relaxed);
    }

    /// Detach the successor list for notification. Successors are one-shot:
    /// after this, the list is empty for good.
    ///
    /// # Safety
    /// Only the worker that just finished this fiber may call this, once.
    pub(crate) unsafe fn take_successors(&self) -> SmallVec<[FiberRef; 2]> {
        mem::take(&mut *self.successors.get())
    }
}

impl Drop for FiberState {
    fn drop(&mut self) {
        if let StackSlot::Owned { base, len } = self.stack.get() {
            self.stack.set(StackSlot::None);
            unsafe {
                libc::munmap(base as *mut libc::c_void, len);
            }
        }
    }
}

/// Record a dataflow edge `pred -> succ`.
///
/// # Safety
/// Both handles must be alive, and neither fiber may have been released
/// yet (wiring is single-threaded by contract).
pub(crate) unsafe fn add_edge(pred: FiberRef, succ: FiberRef) {
    succ.state().increment();
    (*pred.state().successors.get()).push(succ);
}

/// A fiber whose body is a once-called closure, laid out so the state block
/// can be recovered from a type-erased pointer.
#[repr(C)]
pub(crate) struct StackFiber<F> {
    state: FiberState,
    body: UnsafeCell<Option<F>>,
}

impl<F> StackFiber<F>
where
    F: FnOnce() + Send,
{
    pub(crate) fn new(body: F) -> StackFiber<F> {
        StackFiber {
            state: FiberState::new(),
            body: UnsafeCell::new(Some(body)),
        }
    }

    pub(crate) fn state(&self) -> &FiberState {
        &self.state
    }

    /// Erase this fiber into a handle other workers can hold.
    ///
    /// # Safety
    /// The fiber must outlive every use of the handle; the release/notify
    /// protocol is what guarantees it for stack-allocated fibers.
    pub(crate) unsafe fn as_fiber_ref(&self) -> FiberRef {
        FiberRef {
            pointer: self as *const StackFiber<F> as *const (),
            run_fn: run_body::<F>,
        }
    }
}

unsafe fn run_body<F>(pointer: *const ())
where
    F: FnOnce() + Send,
{
    let fiber = &*(pointer as *const StackFiber<F>);
    let body = (*fiber.body.get()).take().unwrap();
    body();
}

/// Type-erased fiber handle; the unit that travels through deques.
#[derive(Clone, Copy)]
pub(crate) struct FiberRef {
    pointer: *const (),
    run_fn: unsafe fn(*const ()),
}

// Handles move between workers; the pointee's thread safety is the
// release/notify protocol's responsibility.
unsafe impl Send for FiberRef {}

impl FiberRef {
    /// # Safety
    /// The underlying fiber must still be alive.
    pub(crate) unsafe fn state(&self) -> &FiberState {
        // StackFiber is repr(C) with the state block first.
        &*(self.pointer as *const FiberState)
    }

    /// Run the fiber's body. Consumes the body; a second call is a
    /// contract violation.
    ///
    /// # Safety
    /// The underlying fiber must be alive and not already running.
    pub(crate) unsafe fn run(&self) {
        (self.run_fn)(self.pointer)
    }

    pub(crate) fn same_fiber(a: FiberRef, b: FiberRef) -> bool {
        ptr::eq(a.pointer, b.pointer)
    }
}

fn map_stack(len: usize) -> (*mut u8, usize) {
    #[cfg(target_os = "linux")]
    const STACK_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
    #[cfg(not(target_os = "linux"))]
    const STACK_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    unsafe {
        let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let total = (len + page - 1) / page * page + page;
        let base = libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            STACK_FLAGS,
            -1,
            0,
        );
        assert!(
            base != libc::MAP_FAILED,
            "failed to map a {} byte fiber stack",
            total
        );
        let rc = libc::mprotect(base, page, libc::PROT_NONE);
        assert_eq!(rc, 0, "failed to protect the fiber stack guard page");
        (base as *mut u8, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_release_at_zero() {
        let fiber = StackFiber::new(|| {});
        assert!(fiber.state().decrement());
    }

    #[test]
    fn edges_arm_the_counter() {
        let pred = StackFiber::new(|| {});
        let succ = StackFiber::new(|| {});
        unsafe {
            add_edge(pred.as_fiber_ref(), succ.as_fiber_ref());
        }
        // One initial reference plus one edge: two releases to reach zero.
        assert!(!succ.state().decrement());
        assert!(succ.state().decrement());
    }

    #[test]
    fn successors_are_taken_once() {
        let pred = StackFiber::new(|| {});
        let succ = StackFiber::new(|| {});
        unsafe {
            add_edge(pred.as_fiber_ref(), succ.as_fiber_ref());
            assert_eq!(pred.state().take_successors().len(), 1);
            assert_eq!(pred.state().take_successors().len(), 0);
        }
    }

    #[test]
    fn body_runs_exactly_once() {
        let mut hits = 0;
        let fiber = StackFiber::new(|| hits += 1);
        unsafe {
            fiber.as_fiber_ref().run();
        }
        drop(fiber);
        assert_eq!(hits, 1);
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = StackFiber::new(|| {});
        let b = StackFiber::new(|| {});
        unsafe {
            assert!(FiberRef::same_fiber(a.as_fiber_ref(), a.as_fiber_ref()));
            assert!(!FiberRef::same_fiber(a.as_fiber_ref(), b.as_fiber_ref()));
        }
    }

    #[test]
    fn owned_stacks_are_mapped_and_reclaimed() {
        let fiber = StackFiber::new(|| {});
        let top = fiber.state().alloc_stack(64 * 1024);
        assert!(!top.is_null());
        assert!(fiber.state().has_stack());
        // Drop unmaps; nothing to observe beyond not crashing.
    }
}
