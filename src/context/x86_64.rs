//! x86-64 System V flavor of the context frame.
//!
//! `save` behaves like a call that can return twice: the frame records the
//! six callee-saved general registers, the caller's stack pointer as it will
//! be after the call returns, and the return address. There are no
//! callee-saved vector registers in this ABI, so none are recorded.

use std::arch::global_asm;

#[repr(C)]
pub(crate) struct Context {
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rsp: u64,
    rip: u64,
}

impl Context {
    pub(crate) fn zeroed() -> Context {
        Context {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
        }
    }

    pub(super) fn set_entry(&mut self, sp: usize, pc: usize) {
        self.rsp = sp as u64;
        self.rip = pc as u64;
    }
}

pub(super) fn trampoline_addr() -> usize {
    spindle_ctx_trampoline as usize
}

extern "C" {
    pub(super) fn spindle_ctx_save(ctx: *mut Context) -> usize;
    pub(super) fn spindle_ctx_restore(ctx: *const Context, val: usize) -> !;
    fn spindle_ctx_trampoline();
}

global_asm!(
    r#"
    .global spindle_ctx_save
    .p2align 4
spindle_ctx_save:
    mov [rdi + 0], rbx
    mov [rdi + 8], rbp
    mov [rdi + 16], r12
    mov [rdi + 24], r13
    mov [rdi + 32], r14
    mov [rdi + 40], r15
    lea rdx, [rsp + 8]
    mov [rdi + 48], rdx
    mov rax, [rsp]
    mov [rdi + 56], rax
    xor eax, eax
    ret

    .global spindle_ctx_restore
    .p2align 4
spindle_ctx_restore:
    mov rbx, [rdi + 0]
    mov rbp, [rdi + 8]
    mov r12, [rdi + 16]
    mov r13, [rdi + 24]
    mov r14, [rdi + 32]
    mov r15, [rdi + 40]
    mov rax, 1
    test rsi, rsi
    cmovne rax, rsi
    mov rdx, [rdi + 56]
    mov rsp, [rdi + 48]
    jmp rdx

    .global spindle_ctx_trampoline
    .p2align 4
spindle_ctx_trampoline:
    mov rdi, rsp
    call spindle_fiber_entry
    ud2
"#
);

// On entry to the trampoline, rsp points at the FiberRef planted by
// init_on_stack, which doubles as the entry argument. rsp is 16-byte
// aligned there, so the call leaves the callee with the ABI-mandated
// alignment.
