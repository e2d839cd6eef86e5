//! # Architecture Abstraction Layer
//!
//! The one piece of machine-level code in the kernel: saving the running
//! execution context and loading another one. Each port provides
//!
//! - [`Context`]: the callee-saved register file of a suspended task,
//! - `switch(old, new)`: store the current registers into `old`, load `new`
//!   and continue wherever `new` was suspended,
//! - `prepare(ctx, stack_top, entry, arg)`: make a fresh context that, when
//!   first switched to, calls `entry(arg)` on the given stack.
//!
//! Only callee-saved state is kept: a switch is an ordinary function call
//! from the compiler's point of view, so caller-saved registers are already
//! spilled by the caller.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{prepare, switch, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{prepare, switch, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("strand supports x86_64 and aarch64 only");

/// Function a fresh context starts in. Must never return.
pub type Entry = extern "C" fn(*mut u8) -> !;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Stack;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static mut MAIN_CTX: *mut Context = core::ptr::null_mut();
    static mut TASK_CTX: *mut Context = core::ptr::null_mut();

    extern "C" fn bounce(arg: *mut u8) -> ! {
        let step = arg as usize;
        loop {
            HITS.fetch_add(step, Ordering::SeqCst);
            // SAFETY: both contexts outlive the test body and are only
            // touched from this thread.
            unsafe { switch(TASK_CTX, MAIN_CTX) };
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = Stack::new(64 * 1024).unwrap();
        let mut main = Context::default();
        let mut task = Context::default();
        prepare(&mut task, stack.top(), bounce, 3 as *mut u8);

        unsafe {
            MAIN_CTX = &mut main;
            TASK_CTX = &mut task;
            switch(MAIN_CTX, TASK_CTX);
            assert_eq!(HITS.load(Ordering::SeqCst), 3);
            switch(MAIN_CTX, TASK_CTX);
            assert_eq!(HITS.load(Ordering::SeqCst), 6);
        }
    }
}
