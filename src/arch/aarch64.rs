//! # AArch64 Port Layer (AAPCS64)
//!
//! Callee-saved state: `x19`–`x28`, the frame pointer `x29`, the link
//! register `x30`, `sp` and the low halves of `v8`–`v15` (`d8`–`d15`).
//!
//! A fresh context starts with `x30` pointing at the trampoline, `x19`
//! holding the entry argument and `x20` the entry function.

use core::arch::naked_asm;

use super::Entry;

/// Saved register file of a suspended task.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    x19_x30: [u64; 12], // 0..96
    sp: u64,            // 96
    d8_d15: [u64; 8],   // 104..168
}

/// Save the current context into `old` and resume `new`.
///
/// # Safety
/// `old` must be writable and `new` must hold a context produced by
/// [`prepare`] or by a previous `switch`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // --- Save current context (x0) ---
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // --- Restore new context (x1) ---
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}

/// First code run on a fresh stack.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm!(
        "mov x0, x19",
        "blr x20",
        "brk #0x1",
    );
}

/// Initialize `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top` (16-byte aligned).
pub fn prepare(ctx: &mut Context, stack_top: *mut u8, entry: Entry, arg: *mut u8) {
    let mut regs = [0u64; 12];
    regs[0] = arg as u64; // x19
    regs[1] = entry as *const () as u64; // x20
    regs[11] = trampoline as *const () as u64; // x30
    *ctx = Context {
        x19_x30: regs,
        sp: (stack_top as usize & !0xF) as u64,
        d8_d15: [0; 8],
    };
}
