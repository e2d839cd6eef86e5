//! Counting semaphore.
//!
//! `value` counts free units; a negative value is the number of blocked
//! tasks. The state sits behind a `spin::Mutex`, the kernel's stand-in for
//! an atomic test-and-set section. The section is never held across a
//! suspension point.

use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelRef};
use crate::sync::wait::WaitQueue;

#[derive(Debug)]
struct SemState {
    value: i32,
    waiting: WaitQueue,
    destroyed: bool,
}

/// Counting semaphore with FIFO wakeups.
pub struct Semaphore {
    kernel: KernelRef,
    state: SpinLock<SemState>,
}

impl Semaphore {
    pub fn new(kernel: &Kernel, value: i32) -> Self {
        Self {
            kernel: kernel.downgrade(),
            state: SpinLock::new(SemState {
                value,
                waiting: WaitQueue::new(),
                destroyed: false,
            }),
        }
    }

    /// Take one unit, blocking while none is free.
    ///
    /// # Errors
    /// - [`Error::Destroyed`] if the semaphore is, or while waiting
    ///   becomes, destroyed.
    /// - [`Error::Deadlock`] if main would wait forever. The unit is given
    ///   back.
    /// - [`Error::Shutdown`] once the kernel was dropped.
    pub fn down(&self) -> Result<()> {
        let kernel = self.kernel.handle()?;
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::Destroyed);
            }
            state.value -= 1;
            if state.value >= 0 {
                drop(state);
                kernel.preempt_check();
                return Ok(());
            }
            if let Err(err) = state.waiting.park(&kernel) {
                state.value += 1;
                return Err(err);
            }
        }

        if let Err(err) = kernel.block() {
            let mut state = self.state.lock();
            if let Err(cancel) = state.waiting.cancel(&kernel, kernel.id()) {
                log::warn!("semaphore down: task {} not withdrawn: {cancel}", kernel.id());
            }
            state.value += 1;
            return Err(err);
        }

        if self.state.lock().destroyed {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    /// Release one unit and wake the longest waiter, if any.
    pub fn up(&self) -> Result<()> {
        let kernel = self.kernel.handle()?;
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::Destroyed);
            }
            state.value += 1;
            if state.value <= 0 {
                state.waiting.wake_one(&kernel);
            }
        }
        kernel.preempt_check();
        Ok(())
    }

    /// Destroy the semaphore. Every waiter wakes with
    /// [`Error::Destroyed`]; later calls fail the same way.
    pub fn destroy(&self) -> Result<()> {
        let kernel = self.kernel.handle()?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        state.destroyed = true;
        let woken = state.waiting.wake_all(&kernel);
        if woken > 0 {
            log::debug!("semaphore destroyed with {woken} waiters");
        }
        Ok(())
    }

    /// Current counter.
    pub fn value(&self) -> i32 {
        self.state.lock().value
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("value", &state.value)
            .field("waiting", &state.waiting.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
