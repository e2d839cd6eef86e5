//! # x86_64 Port Layer (System V ABI)
//!
//! Callee-saved state: `rsp`, `rbp`, `rbx`, `r12`–`r15`, the MXCSR control
//! bits and the x87 control word.
//!
//! ## Fresh Stack Layout
//!
//! ```text
//! stack_top ──► (16-byte aligned)
//!               [ padding    ]
//!   rsp ──────► [ trampoline ]   popped by the first `ret`
//! ```
//!
//! `r12` carries the entry argument and `r13` the entry function; the
//! trampoline moves them into place and realigns the stack before the call.

use core::arch::naked_asm;

use super::Entry;

/// Saved register file of a suspended task.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    rsp: u64, // 0x00
    rbp: u64, // 0x08
    rbx: u64, // 0x10
    r12: u64, // 0x18
    r13: u64, // 0x20
    r14: u64, // 0x28
    r15: u64, // 0x30
    mxcsr: u32, // 0x38
    fpcw: u16,  // 0x3c
}

impl Default for Context {
    fn default() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            // Power-on defaults: all exceptions masked, round to nearest.
            mxcsr: 0x1F80,
            fpcw: 0x037F,
        }
    }
}

/// Save the current context into `old` and resume `new`.
///
/// Returns when some other context switches back to `old`.
///
/// # Safety
/// `old` must be writable and `new` must hold a context produced by
/// [`prepare`] or by a previous `switch`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // --- Save current context (rdi) ---
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr [rdi + 0x38]",
        "fnstcw [rdi + 0x3c]",
        // --- Restore new context (rsi) ---
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr [rsi + 0x38]",
        "fldcw [rsi + 0x3c]",
        // Fresh context: pops the trampoline. Suspended one: returns from
        // its own call to `switch`.
        "ret",
    );
}

/// First code run on a fresh stack.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "and rsp, -16",
        "call r13",
        "ud2",
    );
}

/// Initialize `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top` (16-byte aligned).
pub fn prepare(ctx: &mut Context, stack_top: *mut u8, entry: Entry, arg: *mut u8) {
    let top = stack_top as usize & !0xF;
    let rsp = top - 16;
    // SAFETY: `rsp` lies inside the stack that ends at `stack_top`.
    unsafe {
        (rsp as *mut u64).write(trampoline as *const () as u64);
    }
    *ctx = Context {
        rsp: rsp as u64,
        r12: arg as u64,
        r13: entry as *const () as u64,
        ..Context::default()
    };
}
