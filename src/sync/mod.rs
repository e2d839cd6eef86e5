//! # Synchronization Primitives
//!
//! Blocking primitives for tasks of one kernel. All of them are built on
//! the same park / wake protocol ([`WaitQueue`]):
//!
//! ```text
//!   waiter                              waker
//!   ──────                              ─────
//!   lock section                        lock section
//!   park(kernel)   (WAITING, queued)    wake_one / wake_all (→ READY)
//!   unlock section                      unlock section
//!   kernel.block() ──► dispatcher ──►   ... later selected, block returns
//! ```
//!
//! Critical sections are short `spin::Mutex` sections or semaphores, and
//! none of them is held across `block`.
//!
//! Primitives keep a clone of the [`Kernel`](crate::Kernel) handle and are
//! therefore tied to the kernel's host thread. Share them between tasks
//! through `Rc`.

pub mod barrier;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;
pub mod wait;

pub use barrier::Barrier;
pub use mqueue::MessageQueue;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use wait::WaitQueue;
