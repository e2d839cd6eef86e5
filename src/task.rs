//! # Task Control Block
//!
//! Defines the task model: identity, state machine, static and dynamic
//! priority, CPU accounting, and the owned execution context and stack.
//!
//! ## Priorities
//!
//! Priorities follow the Unix `nice` convention: the range is `-20..=19`
//! and a **numerically lower** value is **more urgent**. Aging lowers the
//! dynamic priority of waiting tasks, which raises their urgency.

use core::fmt;

use crate::arch::Context;
use crate::config::{DEFAULT_PRIORITY, MIN_STACK_SIZE, PRIORITY_MAX, PRIORITY_MIN};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::queue::{Node, Queue};

/// Code run by a task. Its return value becomes the exit code.
pub type TaskBody = Box<dyn FnOnce(&Kernel) -> i32 + 'static>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable handle of a task; also its index in the scheduler arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// The thread that called [`Kernel::init`](crate::Kernel::init).
    pub const MAIN: TaskId = TaskId(0);
    /// The dispatcher task.
    pub const DISPATCHER: TaskId = TaskId(1);

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Node for TaskId {
    fn slot(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///   Created ──► Ready ◄──────────────┐
///                 │ dispatch          │ yield / preempt / woken
///                 ▼                   │
///              Running ──► Waiting ───┤
///                 │    └─► Sleeping ──┘
///                 ▼
///             Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Control block exists but the task has not been queued yet.
    Created,
    /// Runnable, waiting in the ready queue.
    Ready,
    /// Currently executing.
    Running,
    /// Parked on a primitive until another task wakes it.
    Waiting,
    /// Parked until its wake deadline elapses.
    Sleeping,
    /// Finished; the control block is kept for joiners.
    Terminated,
}

/// Check a static priority against the allowed range.
pub fn validate_priority(prio: i32) -> Result<i32> {
    if (PRIORITY_MIN..=PRIORITY_MAX).contains(&prio) {
        Ok(prio)
    } else {
        Err(Error::InvalidPriority(prio))
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Heap-allocated task stack.
pub struct Stack {
    mem: Box<[u8]>,
}

impl Stack {
    /// Allocate `size` bytes, reporting failure instead of aborting.
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument("stack size below MIN_STACK_SIZE"));
        }
        let mut mem = Vec::new();
        mem.try_reserve_exact(size)
            .map_err(|_| Error::StackAllocation { size })?;
        mem.resize(size, 0u8);
        Ok(Self {
            mem: mem.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Highest usable address, aligned down to 16 bytes.
    pub fn top(&mut self) -> *mut u8 {
        let end = self.mem.as_mut_ptr_range().end as usize;
        (end & !0xF) as *mut u8
    }
}

// ---------------------------------------------------------------------------
// Creation options
// ---------------------------------------------------------------------------

/// Options for [`Kernel::spawn_with`](crate::Kernel::spawn_with).
#[derive(Debug, Clone, Copy)]
pub struct TaskOptions {
    /// Static priority, `-20..=19`.
    pub priority: i32,
    /// Whether an exhausted quota forces a yield.
    pub preemptible: bool,
    /// Stack size; `None` uses the kernel's configured size.
    pub stack_size: Option<usize>,
}

impl TaskOptions {
    pub fn priority(mut self, prio: i32) -> Self {
        self.priority = prio;
        self
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            preemptible: true,
            stack_size: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics snapshot
// ---------------------------------------------------------------------------

/// Accounting snapshot of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: i32,
    pub dynamic_priority: i32,
    pub preemptible: bool,
    /// Times the task was dispatched.
    pub activations: u32,
    /// Ticks consumed while running.
    pub cpu_ticks: u64,
    /// Tick at which the task was created.
    pub start_tick: u64,
    /// Set once the task terminated.
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Per-task kernel state.
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Static priority.
    pub priority: i32,
    /// Priority as modified by aging; reset to `priority` on selection.
    pub dynamic_priority: i32,
    pub preemptible: bool,
    /// Ticks left in the current quota.
    pub tick_budget: u32,
    /// Ticks consumed while running.
    pub tick_count: u64,
    pub activations: u32,
    pub start_tick: u64,
    /// Tick at which a sleeping task becomes ready.
    pub wake_at: u64,
    pub exit_code: Option<i32>,
    /// Tasks blocked in `join` on this one.
    pub joiners: Queue<TaskId>,

    /// Saved registers. Boxed so the address survives arena growth.
    pub(crate) context: Box<Context>,
    /// `None` for the main task, which runs on the host thread's stack, and
    /// for terminated tasks once the dispatcher released the stack.
    pub(crate) stack: Option<Stack>,
    /// Taken by the task itself on its first activation.
    pub(crate) body: Option<TaskBody>,
}

impl Task {
    /// A fresh control block in the `Created` state.
    pub fn new(id: TaskId, priority: i32, preemptible: bool, start_tick: u64) -> Self {
        Self {
            id,
            state: TaskState::Created,
            priority,
            dynamic_priority: priority,
            preemptible,
            tick_budget: 0,
            tick_count: 0,
            activations: 0,
            start_tick,
            wake_at: 0,
            exit_code: None,
            joiners: Queue::new("joiners"),
            context: Box::default(),
            stack: None,
            body: None,
        }
    }

    /// Change the static priority. The dynamic priority follows.
    pub fn set_priority(&mut self, prio: i32) -> Result<()> {
        let prio = validate_priority(prio)?;
        self.priority = prio;
        self.dynamic_priority = prio;
        Ok(())
    }

    /// Apply one aging step.
    #[inline]
    pub fn age(&mut self, step: i32) {
        self.dynamic_priority = self.dynamic_priority.saturating_sub(step);
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state == TaskState::Terminated
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            id: self.id,
            state: self.state,
            priority: self.priority,
            dynamic_priority: self.dynamic_priority,
            preemptible: self.preemptible,
            activations: self.activations,
            cpu_ticks: self.tick_count,
            start_tick: self.start_tick,
            exit_code: self.exit_code,
        }
    }

    /// Raw pointer to the saved context, valid while the task exists.
    pub(crate) fn context_ptr(&mut self) -> *mut Context {
        &mut *self.context as *mut Context
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("dynamic_priority", &self.dynamic_priority)
            .field("preemptible", &self.preemptible)
            .field("activations", &self.activations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcb_initialization() {
        let task = Task::new(TaskId(4), 3, true, 17);
        assert_eq!(task.state, TaskState::Created);
        assert_eq!(task.priority, 3);
        assert_eq!(task.dynamic_priority, 3);
        assert_eq!(task.start_tick, 17);
        assert_eq!(task.exit_code, None);
        assert!(task.joiners.is_empty());
        assert!(task.stack.is_none());
        assert!(task.body.is_none());
    }

    #[test]
    fn test_priority_range() {
        assert_eq!(validate_priority(-20), Ok(-20));
        assert_eq!(validate_priority(19), Ok(19));
        assert_eq!(validate_priority(20), Err(Error::InvalidPriority(20)));
        assert_eq!(validate_priority(-21), Err(Error::InvalidPriority(-21)));
    }

    #[test]
    fn test_invalid_priority_leaves_task_unchanged() {
        let mut task = Task::new(TaskId(2), 5, true, 0);
        task.age(3);
        assert_eq!(task.set_priority(40), Err(Error::InvalidPriority(40)));
        assert_eq!(task.priority, 5);
        assert_eq!(task.dynamic_priority, 2);

        task.set_priority(-7).unwrap();
        assert_eq!(task.priority, -7);
        assert_eq!(task.dynamic_priority, -7);
    }

    #[test]
    fn test_aging_saturates() {
        let mut task = Task::new(TaskId(2), 0, true, 0);
        task.dynamic_priority = i32::MIN + 1;
        task.age(5);
        assert_eq!(task.dynamic_priority, i32::MIN);
    }

    #[test]
    fn test_stack_allocation() {
        let mut stack = Stack::new(MIN_STACK_SIZE).unwrap();
        assert_eq!(stack.len(), MIN_STACK_SIZE);
        assert_eq!(stack.top() as usize % 16, 0);

        assert!(matches!(
            Stack::new(usize::MAX),
            Err(Error::StackAllocation { size: usize::MAX })
        ));
        assert!(matches!(Stack::new(1024), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_task_options_builder() {
        let opts = TaskOptions::default().priority(-3).preemptible(false).stack_size(64 * 1024);
        assert_eq!(opts.priority, -3);
        assert!(!opts.preemptible);
        assert_eq!(opts.stack_size, Some(64 * 1024));
    }
}
