//! Single-use barrier.
//!
//! `N` tasks call [`Barrier::join`]; the first `N - 1` block and the `N`th
//! releases everyone at once. The arrival count is guarded by an internal
//! semaphore of one unit. Once released, the barrier stays spent.

use core::cell::RefCell;

use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelRef};
use crate::sync::semaphore::Semaphore;
use crate::sync::wait::WaitQueue;

#[derive(Debug)]
struct BarrierState {
    expected: usize,
    arrived: usize,
    waiting: WaitQueue,
    released: bool,
    destroyed: bool,
}

/// Rendezvous point for a fixed number of tasks.
pub struct Barrier {
    kernel: KernelRef,
    guard: Semaphore,
    state: RefCell<BarrierState>,
}

impl Barrier {
    /// A barrier for `count` tasks.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a count of zero.
    pub fn new(kernel: &Kernel, count: usize) -> Result<Self> {
        if count == 0 {
            log::warn!("barrier rejected: zero participants");
            return Err(Error::InvalidArgument("barrier needs at least one task"));
        }
        Ok(Self {
            kernel: kernel.downgrade(),
            guard: Semaphore::new(kernel, 1),
            state: RefCell::new(BarrierState {
                expected: count,
                arrived: 0,
                waiting: WaitQueue::new(),
                released: false,
                destroyed: false,
            }),
        })
    }

    /// Arrive and wait for the others.
    ///
    /// # Errors
    /// - [`Error::Spent`] when the barrier already released its tasks.
    /// - [`Error::Destroyed`] if the barrier is, or while waiting becomes,
    ///   destroyed.
    /// - [`Error::Deadlock`] if main would wait forever. The arrival is
    ///   withdrawn.
    pub fn join(&self) -> Result<()> {
        let kernel = self.kernel.handle()?;
        self.guard.down()?;
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                drop(state);
                self.guard.up()?;
                return Err(Error::Destroyed);
            }
            if state.released {
                drop(state);
                self.guard.up()?;
                return Err(Error::Spent);
            }

            state.arrived += 1;
            if state.arrived == state.expected {
                let woken = state.waiting.wake_all(&kernel);
                state.released = true;
                log::debug!("barrier released {} tasks", woken + 1);
                drop(state);
                return self.guard.up();
            }

            if let Err(err) = state.waiting.park(&kernel) {
                state.arrived -= 1;
                drop(state);
                self.guard.up()?;
                return Err(err);
            }
        }
        self.guard.up()?;

        if let Err(err) = kernel.block() {
            let mut state = self.state.borrow_mut();
            if let Err(cancel) = state.waiting.cancel(&kernel, kernel.id()) {
                log::warn!("barrier join: task {} not withdrawn: {cancel}", kernel.id());
            }
            state.arrived -= 1;
            return Err(err);
        }

        if self.state.borrow().released {
            Ok(())
        } else {
            Err(Error::Destroyed)
        }
    }

    /// Destroy the barrier. Blocked tasks wake with
    /// [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        let kernel = self.kernel.handle()?;
        self.guard.down()?;
        {
            let mut state = self.state.borrow_mut();
            state.destroyed = true;
            state.waiting.wake_all(&kernel);
        }
        self.guard.destroy()
    }

    /// Tasks currently blocked at the barrier.
    pub fn waiting(&self) -> usize {
        self.state.borrow().waiting.len()
    }

    pub fn is_released(&self) -> bool {
        self.state.borrow().released
    }
}

impl core::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Barrier")
            .field("state", &self.state.borrow())
            .finish()
    }
}
