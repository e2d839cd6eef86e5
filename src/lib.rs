//! # Strand — green-thread scheduling kernel
//!
//! A user-space kernel that multiplexes many tasks onto one host thread.
//! Tasks run on their own stacks and switch cooperatively or when their
//! time quota runs out.
//!
//! ## Overview
//!
//! - **Selection**: priority-based with aging. The most urgent dynamic
//!   priority wins, ties go to the task that waited longest, and every
//!   task left waiting gains urgency, so nobody starves.
//! - **Preemption**: a tick source counts each task's quota down; an
//!   exhausted quota turns the next [`Kernel::preempt_check`] into a yield.
//! - **Blocking**: join, sleep, semaphores, mutexes, barriers and bounded
//!   message queues, all built on one park / wake protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │               Kernel API (kernel.rs)                    │
//! │   init · spawn · yield_now · switch_to · exit · join    │
//! │   sleep · set_priority · systime · preempt_check        │
//! ├──────────────────┬──────────────────┬──────────────────┤
//! │  Scheduler       │   Tick Source    │  Sync Primitives │
//! │  scheduler.rs    │   timer.rs       │  sync/           │
//! │  ─ select()      │   ─ on_tick()    │  ─ WaitQueue     │
//! │  ─ aging         │   ─ quota        │  ─ Semaphore     │
//! │  ─ sleepers      │                  │  ─ Mutex ·Barrier│
//! │                  │                  │  ─ MessageQueue  │
//! ├──────────────────┴──────────────────┴──────────────────┤
//! │        Task Model (task.rs) · Queues (queue.rs)         │
//! │      TCB · TaskState · Stack · residency-checked FIFO   │
//! ├────────────────────────────────────────────────────────┤
//! │          Arch Port (arch/x86_64.rs, arch/aarch64.rs)    │
//! │              Context · switch · prepare                 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use strand::{Config, Kernel};
//!
//! let kernel = Kernel::init(Config::default())?;
//! for i in 0..3 {
//!     kernel.spawn(move |k| {
//!         for round in 0..5 {
//!             log::info!("task {i} round {round}");
//!             k.yield_now();
//!         }
//!         0
//!     })?;
//! }
//! kernel.exit(0);
//! # Ok::<(), strand::Error>(())
//! ```
//!
//! ## Memory Model
//!
//! - **Task arena**: control blocks live in one `Vec`, indexed by
//!   [`TaskId`], and are kept after termination for late joiners.
//! - **Stacks**: one heap allocation per task, released once the task
//!   terminated and control left it.
//! - **One kernel per thread**: the [`Kernel`] handle is `!Send`.
//! - **Teardown**: dropping main's handle frees the kernel even while tasks
//!   stay blocked; primitives then fail with [`Error::Shutdown`].

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;

pub use config::{Clock, Config};
pub use error::{Error, Result};
pub use kernel::Kernel;
pub use sync::{Barrier, MessageQueue, Mutex, MutexGuard, Semaphore, WaitQueue};
pub use task::{TaskId, TaskOptions, TaskState, TaskStats};
