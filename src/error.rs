//! # Errors
//!
//! Every recoverable failure in the kernel is reported through [`Error`].
//! Caller mistakes never corrupt kernel state: the failing operation is a
//! no-op.

use core::fmt;

use crate::queue::QueueError;
use crate::task::TaskId;

/// Failure of a kernel or synchronization operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The stack for a new task could not be allocated.
    StackAllocation { size: usize },
    /// A buffer for a primitive could not be allocated.
    OutOfMemory,
    /// Priority outside `PRIORITY_MIN..=PRIORITY_MAX`.
    InvalidPriority(i32),
    /// An argument was rejected; the payload names it.
    InvalidArgument(&'static str),
    /// No task with this id exists.
    UnknownTask(TaskId),
    /// A queue protocol violation.
    Queue(QueueError),
    /// The primitive was destroyed.
    Destroyed,
    /// The barrier already released its participants.
    Spent,
    /// No task can make progress; the caller would block forever.
    Deadlock,
    /// The tick source could not be started.
    Timer,
    /// A kernel is already live on this thread.
    AlreadyInitialized,
    /// The kernel this primitive belongs to was dropped.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StackAllocation { size } => {
                write!(f, "failed to allocate a {size}-byte task stack")
            }
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::InvalidPriority(prio) => {
                write!(f, "priority {prio} is outside the range -20..=19")
            }
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::UnknownTask(id) => write!(f, "no such task: {id}"),
            Error::Queue(err) => write!(f, "queue error: {err}"),
            Error::Destroyed => f.write_str("primitive has been destroyed"),
            Error::Spent => f.write_str("barrier has already been released"),
            Error::Deadlock => f.write_str("no task can make progress"),
            Error::Timer => f.write_str("failed to start the tick source"),
            Error::AlreadyInitialized => f.write_str("a kernel is already running on this thread"),
            Error::Shutdown => f.write_str("the kernel has shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Queue(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::Queue(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
