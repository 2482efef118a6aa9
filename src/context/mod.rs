//! The CPU context primitive underneath fiber suspension.
//!
//! A `Context` is a frame of callee-saved registers plus a stack pointer and
//! a resume address. `save` persists the current frame and returns
//! `Resume::Direct`; when another party later `restore`s that frame, control
//! comes back to the instruction after the `save`, which this time returns
//! `Resume::Switched` carrying the payload handed to `restore`. `swap` is the
//! save-then-restore pair used at every suspension point.
//!
//! The resumed arm of a `save` may be running on a *different* OS thread than
//! the one that saved: nothing derived from thread identity (thread locals,
//! the current-worker pointer) may be cached in a live variable across a save
//! point. Callers re-query `WorkerThread::current()` after every switch.

use crate::fiber::FiberRef;

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle's context switch is only implemented for x86_64 and aarch64");

pub(crate) use self::arch::Context;

/// How control arrived at the statement after a `save`.
#[derive(Debug)]
pub(crate) enum Resume {
    /// The `save` itself just returned; no switch has happened yet.
    Direct,
    /// A `restore` of the saved frame brought us back here. The payload is
    /// the (nonzero) value the restoring party passed; a zero payload is
    /// remapped to one so the two arms are always distinguishable.
    Switched(usize),
}

impl Context {
    /// Persist the callee-saved frame into `ctx`.
    ///
    /// # Safety
    /// `ctx` must stay valid (and pinned in memory) until it is restored or
    /// abandoned. The caller must uphold the no-caching rule above for the
    /// `Switched` arm.
    #[inline]
    pub(crate) unsafe fn save(ctx: *mut Context) -> Resume {
        match arch::spindle_ctx_save(ctx) {
            0 => Resume::Direct,
            v => Resume::Switched(v),
        }
    }

    /// Resume the frame saved in `ctx`, handing `val` to the resumed party.
    ///
    /// # Safety
    /// `ctx` must hold a frame that was saved (or initialized by
    /// `init_on_stack`) and whose stack is still intact.
    #[inline]
    pub(crate) unsafe fn restore(ctx: *const Context, val: usize) -> ! {
        arch::spindle_ctx_restore(ctx, val)
    }

    /// Save into `from`, then resume `to` with `val`. Returns the payload of
    /// whichever `restore` eventually brings `from` back to life.
    ///
    /// # Safety
    /// Same contracts as `save` and `restore` for the two frames.
    pub(crate) unsafe fn swap(from: *mut Context, to: *const Context, val: usize) -> usize {
        match Context::save(from) {
            Resume::Direct => Context::restore(to, val),
            Resume::Switched(v) => v,
        }
    }

    /// Arrange for a `restore` of `ctx` to begin executing the trampoline on
    /// the fresh stack ending at `stack_top`, with a copy of `fiber` waiting
    /// for it there. The trampoline invokes the fiber entry and never
    /// returns.
    ///
    /// # Safety
    /// `stack_top` must be the one-past-the-end address of a mapped region
    /// large enough for the fiber, and nothing else may be using it.
    pub(crate) unsafe fn init_on_stack(ctx: *mut Context, stack_top: *mut u8, fiber: FiberRef) {
        let top = (stack_top as usize) & !(STACK_ALIGN - 1);
        // The handle lives in the seeded frame's argument space, above the
        // trampoline's stack pointer; it stays untouched for the life of the
        // stack.
        let slot = (top - STACK_ALIGN) as *mut FiberRef;
        slot.write(fiber);
        (*ctx).set_entry(slot as usize, arch::trampoline_addr());
    }
}

/// Stacks hand the trampoline a 16-byte-aligned stack pointer, as both ABIs
/// require at a jump target.
const STACK_ALIGN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn save_is_direct_without_restore() {
        let mut ctx = Context::zeroed();
        match unsafe { Context::save(&mut ctx) } {
            Resume::Direct => {}
            Resume::Switched(v) => panic!("unexpected switched arrival: {}", v),
        }
    }

    #[test]
    fn restore_returns_payload() {
        let mut ctx = Context::zeroed();
        // Values mutated between a save and its resume must live in memory,
        // not registers; an atomic keeps the test honest about that.
        let hits = AtomicUsize::new(0);
        loop {
            match unsafe { Context::save(&mut ctx) } {
                Resume::Direct => {
                    hits.fetch_add(1, Ordering::SeqCst);
                    unsafe { Context::restore(&ctx, 42) };
                }
                Resume::Switched(v) => {
                    assert_eq!(v, 42);
                    break;
                }
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_payload_is_remapped() {
        let mut ctx = Context::zeroed();
        match unsafe { Context::save(&mut ctx) } {
            Resume::Direct => unsafe { Context::restore(&ctx, 0) },
            Resume::Switched(v) => assert_eq!(v, 1),
        }
    }
}
