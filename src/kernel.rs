//! # Kernel
//!
//! The [`Kernel`] handle and the dispatcher. A kernel turns the host thread
//! that calls [`Kernel::init`] into task 0 ("main") and multiplexes every
//! spawned task onto that same thread.
//!
//! ## Startup Sequence
//!
//! ```text
//! Kernel::init(config)
//!   ├─► admit main (task 0, READY)
//!   ├─► create the dispatcher (task 1, not preemptible, never queued)
//!   ├─► start the tick source
//!   └─► transfer to the dispatcher
//!         └─► select() picks main → init returns
//! ```
//!
//! ## Control Flow
//!
//! Every suspension goes through the dispatcher: a task that yields, blocks,
//! sleeps or exits transfers to task 1, which files the task by state,
//! wakes due sleepers, selects the next task and transfers into it. The only
//! direct task-to-task transfer is [`Kernel::switch_to`].
//!
//! When nothing is ready and nothing sleeps the dispatcher *halts*: it hands
//! control to main, whose pending [`exit`](Kernel::exit) returns or whose
//! pending blocking call fails with [`Error::Deadlock`].
//!
//! ## Ownership
//!
//! Only handles returned by [`Kernel::init`] and their clones own the
//! kernel. Task bodies and primitives reach it through a non-owning
//! handle, so a task that stays suspended forever keeps nothing alive.
//! Dropping the last owning handle (from main) frees every stack,
//! stops the tick thread and lets the thread start a new kernel.
//!
//! ## Borrowing Rule
//!
//! All scheduling state sits in one `RefCell`. Each borrow is released
//! before [`arch::switch`] is called, since the context being resumed will
//! borrow it again.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::mem::ManuallyDrop;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::arch;
use crate::config::{Clock, Config, DEFAULT_PRIORITY, PANIC_EXIT_CODE, PRIORITY_MIN};
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::task::{validate_priority, Stack, Task, TaskId, TaskOptions, TaskState, TaskStats};
use crate::timer::Timer;

thread_local! {
    /// Whether a kernel is live on this host thread.
    static LIVE: Cell<bool> = const { Cell::new(false) };
}

/// Unwind payload used by [`Kernel::exit`] to leave a task body early.
struct TaskExit(i32);

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

pub(crate) struct KernelInner {
    sched: RefCell<Scheduler>,
    timer: Timer,
    config: Config,
    /// Set by the dispatcher right before it hands control to main because
    /// no task can make progress.
    halted: Cell<bool>,
    this: Weak<KernelInner>,
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        LIVE.with(|live| live.set(false));
    }
}

enum Step {
    Run(TaskId),
    Idle(Option<u64>),
    Halt,
}

impl KernelInner {
    /// Save the running context and resume `to`.
    ///
    /// Charges the outgoing task for the ticks it used and loads the
    /// incoming task's quota. The caller sets the states of both tasks.
    fn transfer(&self, to: TaskId) {
        let (from_ctx, to_ctx) = {
            let mut guard = self.sched.borrow_mut();
            let s = &mut *guard;
            let from = s.current;
            let (used, left) = self.timer.shared().disarm();
            let outgoing = &mut s.tasks[from.index()];
            outgoing.tick_count += used;
            outgoing.tick_budget = left;

            if to == TaskId::DISPATCHER {
                s.previous = from;
            }
            s.current = to;
            let incoming = &s.tasks[to.index()];
            self.timer.shared().arm(incoming.tick_budget, incoming.preemptible);
            log::trace!("switch {from} -> {to}");

            let from_ctx = s.tasks[from.index()].context_ptr();
            let to_ctx = s.tasks[to.index()].context_ptr();
            (from_ctx, to_ctx)
        };
        // SAFETY: contexts are boxed inside control blocks that live as long
        // as the kernel, and `to` was either prepared by `arch::prepare` or
        // suspended in this very function.
        unsafe { arch::switch(from_ctx, to_ctx) };
    }

    /// Mark the running task terminated and wake its joiners.
    fn terminate_current(&self, code: i32) {
        let mut guard = self.sched.borrow_mut();
        let s = &mut *guard;
        let id = s.current;
        let task = &mut s.tasks[id.index()];
        task.state = TaskState::Terminated;
        task.exit_code = Some(code);

        let mut woken = Vec::new();
        while let Some(joiner) = s.tasks[id.index()].joiners.pop_front(&mut s.links) {
            woken.push(joiner);
        }
        for joiner in woken {
            if let Err(err) = s.make_ready(joiner) {
                log::warn!("task {id} exit: joiner {joiner} not woken: {err}");
            }
        }
    }

    /// Terminate the running task for good.
    fn exit_current(&self, code: i32) -> ! {
        self.terminate_current(code);
        loop {
            // A terminated task is never selected again.
            self.transfer(TaskId::DISPATCHER);
        }
    }

    /// The dispatcher task.
    fn dispatch(&self) -> ! {
        loop {
            let step = {
                let mut s = self.sched.borrow_mut();
                let sleeping = s.wake_sleepers(self.timer.now());
                match s.select() {
                    Some(id) => {
                        let task = &mut s.tasks[id.index()];
                        task.tick_budget = self.config.tick_budget;
                        task.activations += 1;
                        task.state = TaskState::Running;
                        Step::Run(id)
                    }
                    None if sleeping > 0 => Step::Idle(s.next_wakeup()),
                    None => Step::Halt,
                }
            };

            match step {
                Step::Run(id) => self.transfer(id),
                Step::Idle(deadline) => {
                    self.idle(deadline);
                    continue;
                }
                Step::Halt => {
                    log::debug!("dispatcher halted: no task can make progress");
                    self.halted.set(true);
                    self.transfer(TaskId::MAIN);
                }
            }

            let previous = self.sched.borrow().previous;
            self.settle(previous);
        }
    }

    /// Wait for the next tick while only sleepers remain.
    fn idle(&self, deadline: Option<u64>) {
        match self.timer.clock() {
            Clock::Virtual => {
                if let Some(tick) = deadline {
                    self.timer.shared().jump_to(tick);
                }
            }
            Clock::Periodic(_) => {
                let start = self.timer.now();
                while self.timer.now() == start {
                    core::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// File the task that just switched back to the dispatcher, and retire
    /// it if it terminated.
    fn settle(&self, id: TaskId) {
        let mut guard = self.sched.borrow_mut();
        let s = &mut *guard;
        let retiring = s.tasks[id.index()].is_terminated() && !s.links.is_linked(id);
        s.requeue(id);

        if retiring {
            let per_tick = self.timer.clock().tick_millis();
            let now = self.timer.now();
            let task = &mut s.tasks[id.index()];
            task.stack = None;
            log::info!(
                "task {} exit: running time {} ms, cpu time {} ms, {} activations",
                id,
                now.saturating_sub(task.start_tick).saturating_mul(per_tick),
                task.tick_count.saturating_mul(per_tick),
                task.activations
            );
        }
        s.tasks[TaskId::DISPATCHER.index()].activations += 1;
    }
}

extern "C" fn dispatcher_entry(arg: *mut u8) -> ! {
    // SAFETY: `arg` is the kernel's own address; the kernel outlives every
    // context it created.
    let inner = unsafe { &*(arg as *const KernelInner) };
    inner.dispatch()
}

extern "C" fn task_entry(arg: *mut u8) -> ! {
    let ptr = arg as *const KernelInner;
    // SAFETY: as for the dispatcher.
    let inner = unsafe { &*ptr };
    let code = match borrowed(&inner.this) {
        Some(kernel) => kernel.run_current_body(),
        None => PANIC_EXIT_CODE,
    };
    inner.exit_current(code)
}

/// A handle that holds no strong count on the kernel.
fn borrowed(weak: &Weak<KernelInner>) -> Option<ManuallyDrop<Kernel>> {
    let ptr = Rc::into_raw(weak.upgrade()?);
    // SAFETY: `ptr` comes from `Rc::into_raw` and the owning handles keep
    // the count at one or more after the decrement. The returned handle is
    // never dropped, so it never gives back the count it no longer holds.
    unsafe {
        Rc::decrement_strong_count(ptr);
        Some(ManuallyDrop::new(Kernel {
            inner: Rc::from_raw(ptr),
        }))
    }
}

/// Non-owning link from a synchronization primitive to its kernel.
#[derive(Clone)]
pub(crate) struct KernelRef(Weak<KernelInner>);

impl KernelRef {
    /// # Errors
    /// [`Error::Shutdown`] once the kernel was dropped.
    pub(crate) fn handle(&self) -> Result<ManuallyDrop<Kernel>> {
        borrowed(&self.0).ok_or(Error::Shutdown)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string payload"
    }
}

// ---------------------------------------------------------------------------
// Kernel handle
// ---------------------------------------------------------------------------

/// Handle to a running kernel.
///
/// Cheap to clone. Every task body receives a `&Kernel`. The handle is tied
/// to the host thread that created it, and the last owning handle must be
/// dropped by main.
#[derive(Clone)]
pub struct Kernel {
    inner: Rc<KernelInner>,
}

impl Kernel {
    /// Start a kernel on the calling thread, which becomes task 0.
    ///
    /// # Errors
    /// - [`Error::AlreadyInitialized`] if this thread already runs a kernel.
    /// - [`Error::Timer`] if the tick thread cannot be spawned.
    /// - [`Error::StackAllocation`] if the dispatcher stack cannot be
    ///   allocated.
    /// - [`Error::InvalidArgument`] for a zero quota or a negative aging step.
    pub fn init(config: Config) -> Result<Kernel> {
        if LIVE.with(|live| live.replace(true)) {
            return Err(Error::AlreadyInitialized);
        }
        Self::boot(config).inspect_err(|_| LIVE.with(|live| live.set(false)))
    }

    fn boot(config: Config) -> Result<Kernel> {
        if config.tick_budget == 0 {
            return Err(Error::InvalidArgument("tick budget must be non-zero"));
        }
        if config.aging_step < 0 {
            return Err(Error::InvalidArgument("aging step must not be negative"));
        }

        let mut dispatcher_stack = Stack::new(config.stack_size)?;
        let timer = Timer::start(config.clock)?;

        let mut sched = Scheduler::new(config.aging_step);
        sched.admit(Task::new(TaskId::MAIN, DEFAULT_PRIORITY, true, 0));
        sched.make_ready(TaskId::MAIN)?;

        let inner = Rc::new_cyclic(|this| KernelInner {
            sched: RefCell::new(sched),
            timer,
            config,
            halted: Cell::new(false),
            this: this.clone(),
        });

        {
            let mut s = inner.sched.borrow_mut();
            let mut dispatcher = Task::new(TaskId::DISPATCHER, PRIORITY_MIN, false, 0);
            arch::prepare(
                &mut dispatcher.context,
                dispatcher_stack.top(),
                dispatcher_entry,
                Rc::as_ptr(&inner) as *mut u8,
            );
            dispatcher.stack = Some(dispatcher_stack);
            dispatcher.state = TaskState::Ready;
            s.admit(dispatcher);
        }

        log::debug!(
            "kernel up: quota {} ticks, aging step {}, clock {:?}",
            config.tick_budget,
            config.aging_step,
            config.clock
        );
        inner.transfer(TaskId::DISPATCHER);
        Ok(Kernel { inner })
    }

    /// The configuration the kernel was started with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> KernelRef {
        KernelRef(Rc::downgrade(&self.inner))
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Spawn a task with default options.
    pub fn spawn<F>(&self, body: F) -> Result<TaskId>
    where
        F: FnOnce(&Kernel) -> i32 + 'static,
    {
        self.spawn_with(TaskOptions::default(), body)
    }

    /// Spawn a task. It becomes READY immediately.
    ///
    /// Returning from `body` exits the task with the returned code; a panic
    /// is caught at the task boundary and exits it with
    /// [`PANIC_EXIT_CODE`].
    ///
    /// # Errors
    /// - [`Error::InvalidPriority`] for a priority outside `-20..=19`.
    /// - [`Error::StackAllocation`] / [`Error::InvalidArgument`] when the
    ///   stack cannot be created. Nothing is enqueued in that case.
    pub fn spawn_with<F>(&self, options: TaskOptions, body: F) -> Result<TaskId>
    where
        F: FnOnce(&Kernel) -> i32 + 'static,
    {
        let priority = validate_priority(options.priority).inspect_err(|err| {
            log::warn!("spawn rejected: {err}");
        })?;
        let size = options.stack_size.unwrap_or(self.inner.config.stack_size);
        let mut stack = Stack::new(size)?;

        let id = {
            let mut s = self.inner.sched.borrow_mut();
            let id = s.next_id();
            let mut task = Task::new(id, priority, options.preemptible, self.inner.timer.now());
            arch::prepare(
                &mut task.context,
                stack.top(),
                task_entry,
                Rc::as_ptr(&self.inner) as *mut u8,
            );
            task.stack = Some(stack);
            task.body = Some(Box::new(body));
            s.admit(task);
            s.make_ready(id)?;
            id
        };
        log::debug!("spawned task {id} (priority {priority}, {size}-byte stack)");

        self.preempt_check();
        Ok(id)
    }

    fn run_current_body(&self) -> i32 {
        let (id, body) = {
            let mut s = self.inner.sched.borrow_mut();
            let task = s.current_task_mut();
            (task.id, task.body.take())
        };
        let Some(body) = body else {
            log::error!("task {id} started without a body");
            return PANIC_EXIT_CODE;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(code) => code,
            Err(payload) => match payload.downcast::<TaskExit>() {
                Ok(exit) => exit.0,
                Err(payload) => {
                    log::error!("task {id} panicked: {}", panic_message(&*payload));
                    PANIC_EXIT_CODE
                }
            },
        }
    }

    /// Terminate the calling task with `code`.
    ///
    /// In a spawned task this unwinds the body (running destructors) and
    /// never returns. In main it returns once no other task can make
    /// progress.
    pub fn exit(&self, code: i32) {
        if self.id() != TaskId::MAIN {
            panic::resume_unwind(Box::new(TaskExit(code)));
        }

        let done = self.inner.sched.borrow().current_task().is_terminated();
        if !done {
            self.inner.terminate_current(code);
        }
        self.inner.transfer(TaskId::DISPATCHER);
        self.inner.halted.set(false);
    }

    /// Give up the CPU. The caller goes to the back of the ready queue.
    pub fn yield_now(&self) {
        self.inner.sched.borrow_mut().current_task_mut().state = TaskState::Ready;
        self.inner.transfer(TaskId::DISPATCHER);
    }

    /// Hand the CPU straight to `target`, bypassing selection.
    ///
    /// The caller becomes READY. `target` must be READY.
    pub fn switch_to(&self, target: TaskId) -> Result<()> {
        {
            let mut guard = self.inner.sched.borrow_mut();
            let s = &mut *guard;
            let state = s.task(target)?.state;
            if target == TaskId::DISPATCHER || target == s.current {
                return Err(Error::InvalidArgument("cannot switch to self or the dispatcher"));
            }
            if state != TaskState::Ready || !s.ready.contains(target) {
                return Err(Error::InvalidArgument("switch target is not ready"));
            }
            s.ready.remove(&mut s.links, target)?;
            let current = s.current;
            s.make_ready(current)?;

            let task = &mut s.tasks[target.index()];
            task.tick_budget = self.inner.config.tick_budget;
            task.activations += 1;
            task.dynamic_priority = task.priority;
            task.state = TaskState::Running;
        }
        self.inner.transfer(target);
        Ok(())
    }

    /// Wait for `target` to terminate and return its exit code.
    ///
    /// Joining a task that already terminated returns at once, as often as
    /// asked, from any caller.
    ///
    /// # Errors
    /// - [`Error::UnknownTask`] if `target` does not exist.
    /// - [`Error::InvalidArgument`] when joining oneself or the dispatcher.
    /// - [`Error::Deadlock`] if main would wait forever.
    pub fn join(&self, target: TaskId) -> Result<i32> {
        loop {
            {
                let mut guard = self.inner.sched.borrow_mut();
                let s = &mut *guard;
                let current = s.current;
                let exit_code = s.task(target)?.exit_code;
                if target == current || target == TaskId::DISPATCHER {
                    return Err(Error::InvalidArgument("cannot join self or the dispatcher"));
                }
                if let Some(code) = exit_code {
                    return Ok(code);
                }
                s.tasks[target.index()].joiners.append(&mut s.links, current)?;
                s.tasks[current.index()].state = TaskState::Waiting;
            }

            if let Err(err) = self.block() {
                let mut guard = self.inner.sched.borrow_mut();
                let s = &mut *guard;
                let current = s.current;
                if let Err(cancel) = s.tasks[target.index()].joiners.remove(&mut s.links, current) {
                    log::warn!("join({target}): task {current} not withdrawn: {cancel}");
                }
                return Err(err);
            }
        }
    }

    /// Suspend the caller for at least `ms` milliseconds, rounded up to
    /// whole ticks. `sleep(0)` is a yield.
    pub fn sleep(&self, ms: u64) {
        if ms == 0 {
            self.yield_now();
            return;
        }
        {
            let now = self.inner.timer.now();
            let ticks = self.inner.timer.clock().ticks_for(ms);
            let mut s = self.inner.sched.borrow_mut();
            let task = s.current_task_mut();
            task.wake_at = now.saturating_add(ticks);
            task.state = TaskState::Sleeping;
        }
        // Filed in the sleeping queue by the dispatcher.
        if let Err(err) = self.block() {
            log::warn!("sleep interrupted: {err}");
        }
    }

    /// Transfer to the dispatcher without changing the caller's state.
    ///
    /// Used after parking in a [`WaitQueue`](crate::WaitQueue). Returns once
    /// the caller was woken and selected again.
    ///
    /// # Errors
    /// [`Error::Deadlock`] when the dispatcher halted while the caller
    /// (necessarily main) was still parked. The caller is RUNNING again but
    /// stays in whatever queue it parked in; withdraw it with
    /// [`WaitQueue::cancel`](crate::WaitQueue::cancel).
    pub fn block(&self) -> Result<()> {
        self.inner.transfer(TaskId::DISPATCHER);
        if self.inner.halted.take() {
            self.inner.sched.borrow_mut().current_task_mut().state = TaskState::Running;
            log::debug!("task {} would block forever", self.id());
            return Err(Error::Deadlock);
        }
        Ok(())
    }

    /// Yield if the running task's quota expired.
    ///
    /// The only place preemption happens. Skipped when the caller is not
    /// RUNNING or sits in a wait queue.
    pub fn preempt_check(&self) {
        let shared = self.inner.timer.shared();
        if !shared.is_expired() {
            return;
        }
        let id = {
            let s = self.inner.sched.borrow();
            let id = s.current;
            if id == TaskId::DISPATCHER
                || s.current_task().state != TaskState::Running
                || s.links.is_linked(id)
            {
                return;
            }
            id
        };
        shared.take_expired();
        log::trace!("task {id} preempted");
        self.yield_now();
    }

    // -----------------------------------------------------------------------
    // Queries and tuning
    // -----------------------------------------------------------------------

    /// Id of the calling task.
    pub fn id(&self) -> TaskId {
        self.inner.sched.borrow().current
    }

    /// Set the static priority of `task` (the caller when `None`). The
    /// dynamic priority is reset to it.
    ///
    /// # Errors
    /// - [`Error::UnknownTask`] if `task` does not exist.
    /// - [`Error::InvalidArgument`] for the dispatcher.
    /// - [`Error::InvalidPriority`] for a priority outside `-20..=19`.
    pub fn set_priority(&self, task: Option<TaskId>, prio: i32) -> Result<()> {
        let mut s = self.inner.sched.borrow_mut();
        let id = task.unwrap_or(s.current);
        s.task(id)?;
        if id == TaskId::DISPATCHER {
            log::warn!("set_priority({id}): the dispatcher is not tunable");
            return Err(Error::InvalidArgument("cannot tune the dispatcher"));
        }
        s.task_mut(id)?.set_priority(prio).inspect_err(|err| {
            log::warn!("set_priority({id}): {err}");
        })?;
        log::debug!("task {id} priority set to {prio}");
        Ok(())
    }

    /// Static priority of `task` (the caller when `None`).
    pub fn priority(&self, task: Option<TaskId>) -> Result<i32> {
        let s = self.inner.sched.borrow();
        let id = task.unwrap_or(s.current);
        Ok(s.task(id)?.priority)
    }

    /// Allow or forbid preemption of `task` (the caller when `None`).
    ///
    /// # Errors
    /// [`Error::UnknownTask`] if `task` does not exist,
    /// [`Error::InvalidArgument`] for the dispatcher.
    pub fn set_preemptible(&self, task: Option<TaskId>, preemptible: bool) -> Result<()> {
        let mut s = self.inner.sched.borrow_mut();
        let id = task.unwrap_or(s.current);
        s.task(id)?;
        if id == TaskId::DISPATCHER {
            log::warn!("set_preemptible({id}): the dispatcher is not tunable");
            return Err(Error::InvalidArgument("cannot tune the dispatcher"));
        }
        s.task_mut(id)?.preemptible = preemptible;
        if id == s.current {
            self.inner.timer.shared().set_preemptible(preemptible);
        }
        Ok(())
    }

    /// Ticks since the kernel started.
    pub fn systime(&self) -> u64 {
        let now = self.inner.timer.now();
        self.preempt_check();
        now
    }

    /// Run the tick handler `ticks` times. Meant for [`Clock::Virtual`];
    /// the resulting preemption, if any, happens at the next
    /// [`preempt_check`](Self::preempt_check).
    pub fn advance(&self, ticks: u64) {
        let shared = self.inner.timer.shared();
        for _ in 0..ticks {
            shared.on_tick();
        }
    }

    pub fn state(&self, task: TaskId) -> Result<TaskState> {
        Ok(self.inner.sched.borrow().task(task)?.state)
    }

    /// Accounting snapshot of `task`.
    pub fn stats(&self, task: TaskId) -> Result<TaskStats> {
        Ok(self.inner.sched.borrow().task(task)?.stats())
    }

    // -----------------------------------------------------------------------
    // Wait queue plumbing
    // -----------------------------------------------------------------------

    /// Mark the caller WAITING and append it to `queue`.
    pub(crate) fn park_in(&self, queue: &mut Queue<TaskId>) -> Result<()> {
        self.inner
            .sched
            .borrow_mut()
            .park_current(queue, TaskState::Waiting)
    }

    /// Move the front of `queue` to the ready queue.
    pub(crate) fn wake_from(&self, queue: &mut Queue<TaskId>) -> Option<TaskId> {
        let mut s = self.inner.sched.borrow_mut();
        let id = queue.pop_front(&mut s.links)?;
        if let Err(err) = s.make_ready(id) {
            log::warn!("wake of task {id} failed: {err}");
        }
        Some(id)
    }

    /// Take `id` out of `queue` without waking it.
    pub(crate) fn withdraw(&self, queue: &mut Queue<TaskId>, id: TaskId) -> Result<()> {
        let mut s = self.inner.sched.borrow_mut();
        queue.remove(&mut s.links, id)?;
        Ok(())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.sched.borrow();
        f.debug_struct("Kernel")
            .field("current", &s.current)
            .field("tasks", &s.tasks.len())
            .field("ready", &s.ready)
            .field("now", &self.inner.timer.now())
            .finish()
    }
}
