//! Park / wake queue shared by every blocking primitive.

use crate::error::Result;
use crate::kernel::Kernel;
use crate::queue::Queue;
use crate::task::TaskId;

/// FIFO of tasks waiting for some condition.
#[derive(Debug)]
pub struct WaitQueue {
    queue: Queue<TaskId>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            queue: Queue::new("wait"),
        }
    }

    /// Mark the calling task WAITING and append it.
    ///
    /// The caller must follow up with [`Kernel::block`] once it released
    /// whatever lock protects the condition.
    pub fn park(&mut self, kernel: &Kernel) -> Result<()> {
        kernel.park_in(&mut self.queue)
    }

    /// Make the longest waiter READY.
    pub fn wake_one(&mut self, kernel: &Kernel) -> Option<TaskId> {
        kernel.wake_from(&mut self.queue)
    }

    /// Make every waiter READY, in arrival order. Returns how many woke.
    pub fn wake_all(&mut self, kernel: &Kernel) -> usize {
        let mut woken = 0;
        while self.wake_one(kernel).is_some() {
            woken += 1;
        }
        woken
    }

    /// Withdraw `id` without waking it.
    pub fn cancel(&mut self, kernel: &Kernel, id: TaskId) -> Result<()> {
        kernel.withdraw(&mut self.queue, id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.queue.contains(id)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
