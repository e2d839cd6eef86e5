//! # Scheduler
//!
//! The task arena, the per-state collections, and the selection policy.
//! Nothing in here switches context; the dispatcher in
//! [`kernel`](crate::kernel) drives it.
//!
//! ## Selection Algorithm
//!
//! At each scheduling decision:
//! 1. **Reduce** the ready queue front to back, keeping the task with the
//!    most urgent (numerically lowest) dynamic priority. Only a strictly
//!    more urgent candidate replaces the current best, so ties resolve to
//!    the task that has waited longest (FCFS within a priority band).
//! 2. **Age** every ready task by `aging_step`.
//! 3. **Reset** the chosen task's dynamic priority to its static priority
//!    and take it out of the ready queue.
//!
//! ## Starvation Bound
//!
//! A task skipped for `k` decisions has gained `k * aging_step` urgency,
//! while the winner restarts from its static priority. A task `d` levels
//! behind a competitor therefore runs within `d / aging_step + 2`
//! decisions.

use crate::error::{Error, Result};
use crate::queue::{Links, Queue};
use crate::task::{Task, TaskId, TaskState};

/// Kernel-wide scheduling state: every control block plus the collections
/// that hold them.
pub struct Scheduler {
    /// Arena of control blocks, indexed by `TaskId`. Never shrinks.
    pub tasks: Vec<Task>,
    /// Residency table shared by every queue holding task ids.
    pub links: Links,
    pub ready: Queue<TaskId>,
    /// Tasks marked waiting outside any primitive's queue.
    pub waiting: Queue<TaskId>,
    pub sleeping: Queue<TaskId>,
    pub terminated: Queue<TaskId>,
    /// Task whose context is loaded.
    pub current: TaskId,
    /// Task that most recently transferred control to the dispatcher.
    pub previous: TaskId,
    aging_step: i32,
}

impl Scheduler {
    pub fn new(aging_step: i32) -> Self {
        Self {
            tasks: Vec::new(),
            links: Links::new(),
            ready: Queue::new("ready"),
            waiting: Queue::new("waiting"),
            sleeping: Queue::new("sleeping"),
            terminated: Queue::new("terminated"),
            current: TaskId::MAIN,
            previous: TaskId::MAIN,
            aging_step,
        }
    }

    /// Id the next admitted task will receive.
    pub fn next_id(&self) -> TaskId {
        TaskId(self.tasks.len())
    }

    /// Add a control block to the arena. Its id must be [`next_id`](Self::next_id).
    pub fn admit(&mut self, task: Task) -> TaskId {
        let id = task.id;
        debug_assert_eq!(id, self.next_id());
        self.tasks.push(task);
        self.links.grow_to(self.tasks.len());
        id
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(id.index()).ok_or(Error::UnknownTask(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(id.index()).ok_or(Error::UnknownTask(id))
    }

    pub fn current_task(&self) -> &Task {
        &self.tasks[self.current.index()]
    }

    pub fn current_task_mut(&mut self) -> &mut Task {
        let idx = self.current.index();
        &mut self.tasks[idx]
    }

    /// Mark `id` ready and append it to the ready queue.
    pub fn make_ready(&mut self, id: TaskId) -> Result<()> {
        self.ready.append(&mut self.links, id)?;
        self.tasks[id.index()].state = TaskState::Ready;
        Ok(())
    }

    /// Pick the next task to run, or `None` when nothing is ready.
    pub fn select(&mut self) -> Option<TaskId> {
        let tasks = &self.tasks;
        let chosen = self.ready.reduce(None, |best: Option<TaskId>, id| match best {
            Some(b) if tasks[id.index()].dynamic_priority >= tasks[b.index()].dynamic_priority => {
                Some(b)
            }
            _ => Some(id),
        })?;

        let step = self.aging_step;
        let tasks = &mut self.tasks;
        self.ready.foreach(|id| tasks[id.index()].age(step));

        let task = &mut self.tasks[chosen.index()];
        task.dynamic_priority = task.priority;

        self.ready.remove(&mut self.links, chosen).ok()
    }

    /// Move every sleeper whose deadline is `<= now` to the ready queue.
    /// Returns how many are still asleep.
    pub fn wake_sleepers(&mut self, now: u64) -> usize {
        let due: Vec<TaskId> = self
            .sleeping
            .iter()
            .filter(|id| self.tasks[id.index()].wake_at <= now)
            .collect();
        for id in due {
            if self.sleeping.remove(&mut self.links, id).is_ok() {
                if let Err(err) = self.make_ready(id) {
                    log::warn!("wake of sleeper {id} failed: {err}");
                }
            }
        }
        self.sleeping.len()
    }

    /// Earliest wake deadline among sleepers.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.sleeping.iter().map(|id| self.tasks[id.index()].wake_at).min()
    }

    /// Put a task that just gave up the CPU into the collection matching its
    /// state, unless it already parked itself somewhere.
    pub fn requeue(&mut self, id: TaskId) {
        if id == TaskId::DISPATCHER || self.links.is_linked(id) {
            return;
        }
        let state = self.tasks[id.index()].state;
        let result = match state {
            TaskState::Ready | TaskState::Running | TaskState::Created => self.make_ready(id),
            TaskState::Waiting => self.waiting.append(&mut self.links, id).map_err(Error::from),
            TaskState::Sleeping => self.sleeping.append(&mut self.links, id).map_err(Error::from),
            TaskState::Terminated => self
                .terminated
                .append(&mut self.links, id)
                .map_err(Error::from),
        };
        if let Err(err) = result {
            log::warn!("requeue of task {id} ({state:?}) failed: {err}");
        }
    }

    /// Park the running task in `queue` with the given state.
    pub fn park_current(&mut self, queue: &mut Queue<TaskId>, state: TaskState) -> Result<()> {
        let id = self.current;
        queue.append(&mut self.links, id)?;
        self.tasks[id.index()].state = state;
        Ok(())
    }
}
