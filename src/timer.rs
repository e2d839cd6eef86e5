//! # Tick Source
//!
//! Drives time and preemption. The tick handler is the kernel's interrupt
//! boundary: it runs on another host thread (periodic clock) and therefore
//! only ever touches the atomics in [`TickShared`]. It never switches
//! context itself. It raises `expired` and the running task turns that into
//! a yield at its next [`Kernel::preempt_check`](crate::Kernel::preempt_check).
//!
//! ## Per-tick work
//!
//! ```text
//! on_tick()
//!   ├─ ticks += 1                      global clock (systime)
//!   ├─ running_ticks += 1              charged to the running task later
//!   ├─ running task not preemptible?   → done
//!   └─ budget -= 1; reached zero?      → expired = true
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Clock;
use crate::error::{Error, Result};

/// State shared between the kernel and the tick thread.
#[derive(Debug, Default)]
pub struct TickShared {
    ticks: AtomicU64,
    running_ticks: AtomicU32,
    budget: AtomicU32,
    preemptible: AtomicBool,
    expired: AtomicBool,
    stop: AtomicBool,
}

impl TickShared {
    /// The tick handler.
    pub fn on_tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        self.running_ticks.fetch_add(1, Ordering::AcqRel);

        if !self.preemptible.load(Ordering::Acquire) {
            return;
        }

        let prev = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(1)))
            .unwrap_or(0);
        if prev <= 1 {
            self.expired.store(true, Ordering::Release);
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Load the quota of the task about to run.
    pub fn arm(&self, budget: u32, preemptible: bool) {
        self.running_ticks.store(0, Ordering::Release);
        self.budget.store(budget, Ordering::Release);
        self.expired.store(false, Ordering::Release);
        self.preemptible.store(preemptible, Ordering::Release);
    }

    /// Change whether the running task can be preempted.
    pub fn set_preemptible(&self, preemptible: bool) {
        self.preemptible.store(preemptible, Ordering::Release);
        if !preemptible {
            self.expired.store(false, Ordering::Release);
        }
    }

    /// Stop charging the outgoing task. Returns `(ticks consumed, budget
    /// left)`.
    pub fn disarm(&self) -> (u64, u32) {
        self.preemptible.store(false, Ordering::Release);
        let used = self.running_ticks.swap(0, Ordering::AcqRel);
        let left = self.budget.load(Ordering::Acquire);
        (u64::from(used), left)
    }

    /// Consume the expired flag.
    pub fn take_expired(&self) -> bool {
        self.expired.swap(false, Ordering::AcqRel)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Move the clock forward to `tick` without charging anyone. Used by the
    /// virtual clock when every task is asleep.
    pub fn jump_to(&self, tick: u64) {
        self.ticks.fetch_max(tick, Ordering::AcqRel);
    }
}

/// Owner of the tick source; stops the tick thread on drop.
pub struct Timer {
    shared: Arc<TickShared>,
    clock: Clock,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Start ticking according to `clock`.
    pub fn start(clock: Clock) -> Result<Self> {
        let shared = Arc::new(TickShared::default());
        let thread = match clock {
            Clock::Periodic(interval) => Some(spawn_ticker(Arc::clone(&shared), interval)?),
            Clock::Virtual => None,
        };
        Ok(Self {
            shared,
            clock,
            thread,
        })
    }

    pub fn shared(&self) -> &TickShared {
        &self.shared
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.clock, Clock::Virtual)
    }

    pub fn now(&self) -> u64 {
        self.shared.now()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("tick thread panicked");
            }
        }
    }
}

fn spawn_ticker(shared: Arc<TickShared>, interval: Duration) -> Result<JoinHandle<()>> {
    if interval.is_zero() {
        return Err(Error::InvalidArgument("tick interval must be non-zero"));
    }
    thread::Builder::new()
        .name("strand-tick".into())
        .spawn(move || {
            // Absolute deadlines keep the average rate exact even when a
            // single sleep overshoots.
            let mut next = Instant::now() + interval;
            while !shared.stop.load(Ordering::Acquire) {
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                }
                shared.on_tick();
                next += interval;
            }
        })
        .map_err(|err| {
            log::error!("failed to spawn tick thread: {err}");
            Error::Timer
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_time_and_cpu() {
        let shared = TickShared::default();
        shared.arm(5, true);
        shared.on_tick();
        shared.on_tick();
        assert_eq!(shared.now(), 2);
        assert_eq!(shared.disarm(), (2, 3));
    }

    #[test]
    fn test_budget_exhaustion_raises_expired() {
        let shared = TickShared::default();
        shared.arm(3, true);
        shared.on_tick();
        shared.on_tick();
        assert!(!shared.is_expired());
        shared.on_tick();
        assert!(shared.take_expired());
        assert!(!shared.take_expired(), "flag is consumed");
    }

    #[test]
    fn test_non_preemptible_never_expires() {
        let shared = TickShared::default();
        shared.arm(1, false);
        for _ in 0..10 {
            shared.on_tick();
        }
        assert!(!shared.is_expired());
        assert_eq!(shared.disarm(), (10, 1));
    }

    #[test]
    fn test_disabling_preemption_drops_pending_expiry() {
        let shared = TickShared::default();
        shared.arm(1, true);
        shared.on_tick();
        shared.set_preemptible(false);
        assert!(!shared.is_expired());
        shared.on_tick();
        assert!(!shared.is_expired());
    }

    #[test]
    fn test_arm_clears_previous_expiry() {
        let shared = TickShared::default();
        shared.arm(1, true);
        shared.on_tick();
        assert!(shared.is_expired());
        shared.arm(20, true);
        assert!(!shared.is_expired());
    }

    #[test]
    fn test_jump_never_moves_backwards() {
        let shared = TickShared::default();
        shared.jump_to(40);
        shared.jump_to(10);
        assert_eq!(shared.now(), 40);
    }

    #[test]
    fn test_periodic_timer_ticks() {
        let timer = Timer::start(Clock::Periodic(Duration::from_millis(1))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while timer.now() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(timer.now() >= 5, "timer did not advance: {}", timer.now());
    }

    #[test]
    fn test_virtual_timer_is_still() {
        let timer = Timer::start(Clock::Virtual).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.now(), 0);
        assert!(timer.is_virtual());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(matches!(
            Timer::start(Clock::Periodic(Duration::ZERO)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
