//! # Strand Configuration
//!
//! Compile-time defaults governing the scheduler, plus the runtime
//! [`Config`] handed to [`Kernel::init`](crate::Kernel::init).

use core::time::Duration;

/// Default per-task stack size in bytes. Task bodies run ordinary Rust code
/// (formatting, logging, panic unwinding), so this is generous.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack a task may be created with.
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// Ticks a task may run before the preemption check forces a yield.
pub const DEFAULT_TICK_BUDGET: u32 = 20;

/// Dynamic-priority step applied to every ready task per scheduling decision.
pub const AGING_STEP: i32 = 1;

/// Period of the tick source. One tick is one millisecond by default.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Most urgent static priority.
pub const PRIORITY_MIN: i32 = -20;

/// Least urgent static priority.
pub const PRIORITY_MAX: i32 = 19;

/// Priority of the main task and of tasks spawned without options.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Exit code recorded for a task whose body panicked.
pub const PANIC_EXIT_CODE: i32 = -1;

/// Where ticks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// A host thread fires the tick handler every `interval`.
    Periodic(Duration),
    /// Time only moves through [`Kernel::advance`](crate::Kernel::advance),
    /// or when the dispatcher idles with sleeping tasks, in which case it
    /// jumps to the earliest wake deadline.
    Virtual,
}

impl Clock {
    /// Milliseconds represented by one tick.
    pub fn tick_millis(&self) -> u64 {
        match self {
            Clock::Periodic(interval) => (interval.as_millis() as u64).max(1),
            Clock::Virtual => TICK_INTERVAL.as_millis() as u64,
        }
    }

    /// Number of whole ticks covering `ms` milliseconds (rounded up).
    pub fn ticks_for(&self, ms: u64) -> u64 {
        let per_tick = self.tick_millis();
        ms.div_ceil(per_tick)
    }
}

/// Runtime kernel configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Stack size for tasks spawned without an explicit size.
    pub stack_size: usize,
    /// Quota granted on every dispatch.
    pub tick_budget: u32,
    /// Aging step applied per scheduling decision.
    pub aging_step: i32,
    /// Tick source.
    pub clock: Clock,
}

impl Config {
    /// Deterministic configuration: no timer thread, time moves only when the
    /// application advances it or the dispatcher idles.
    pub fn virtual_clock() -> Self {
        Self {
            clock: Clock::Virtual,
            ..Self::default()
        }
    }

    /// Same configuration with a different quota.
    pub fn with_tick_budget(mut self, ticks: u32) -> Self {
        self.tick_budget = ticks;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            tick_budget: DEFAULT_TICK_BUDGET,
            aging_step: AGING_STEP,
            clock: Clock::Periodic(TICK_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.tick_budget, 20);
        assert_eq!(config.aging_step, 1);
        assert_eq!(config.clock, Clock::Periodic(Duration::from_millis(1)));
        assert!(DEFAULT_STACK_SIZE >= MIN_STACK_SIZE);
    }

    #[test]
    fn test_ticks_for_rounds_up() {
        let clock = Clock::Periodic(Duration::from_millis(4));
        assert_eq!(clock.ticks_for(0), 0);
        assert_eq!(clock.ticks_for(1), 1);
        assert_eq!(clock.ticks_for(8), 2);
        assert_eq!(clock.ticks_for(9), 3);
        assert_eq!(Clock::Virtual.ticks_for(25), 25);
    }

    #[test]
    fn test_sub_millisecond_interval_counts_as_one() {
        let clock = Clock::Periodic(Duration::from_micros(250));
        assert_eq!(clock.tick_millis(), 1);
    }
}
