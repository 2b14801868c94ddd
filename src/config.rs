//! Port configuration
//!
//! Directory capacity, preemption policy and the tick period of the
//! bundled tick driver. Signal numbers are fixed constants.
//!
//! Author: Moroya Sakamoto

use core::time::Duration;

use libc::c_int;

/// Default directory capacity (`_POSIX_THREAD_THREADS_MAX`)
pub const DEFAULT_MAX_TASKS: usize = 64;

/// Default tick period: 20 Hz
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(50);

/// Signal that parks a task thread
pub const SIG_SUSPEND: c_int = libc::SIGUSR1;

/// Signal that unparks a task thread (and wakes the start thread at the end)
pub const SIG_RESUME: c_int = libc::SIGUSR2;

/// Signal number reported by the tick driver
pub const SIG_TICK: c_int = libc::SIGALRM;

/// Port configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Maximum number of concurrently existing task threads
    pub max_tasks: usize,
    /// Whether a tick asks the kernel to select the next task
    pub preemption: bool,
    /// Period of the tick driver
    pub tick_period: Duration,
    /// Stack size for task threads (`None` = OS default)
    pub stack_size: Option<usize>,
}

impl PortConfig {
    /// Configuration with the given directory capacity
    pub const fn new(max_tasks: usize) -> Self {
        Self {
            max_tasks,
            preemption: true,
            tick_period: DEFAULT_TICK_PERIOD,
            stack_size: None,
        }
    }

    /// Small configuration for tests: 8 slots, 1 ms ticks
    pub const fn testing() -> Self {
        Self {
            max_tasks: 8,
            preemption: true,
            tick_period: Duration::from_millis(1),
            stack_size: None,
        }
    }

    /// Enable or disable tick preemption
    pub const fn with_preemption(mut self, preemption: bool) -> Self {
        self.preemption = preemption;
        self
    }

    /// Set the tick driver period
    pub const fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Set the task thread stack size
    pub const fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TASKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PortConfig::default();
        assert_eq!(config.max_tasks, DEFAULT_MAX_TASKS);
        assert!(config.preemption);
        assert_eq!(config.tick_period, Duration::from_millis(50));
        assert_eq!(config.stack_size, None);
    }

    #[test]
    fn test_builder() {
        let config = PortConfig::new(4)
            .with_preemption(false)
            .with_tick_period(Duration::from_millis(10))
            .with_stack_size(64 * 1024);
        assert_eq!(config.max_tasks, 4);
        assert!(!config.preemption);
        assert_eq!(config.tick_period, Duration::from_millis(10));
        assert_eq!(config.stack_size, Some(64 * 1024));
    }

    #[test]
    fn test_protocol_signals_distinct() {
        assert_ne!(SIG_SUSPEND, SIG_RESUME);
        assert_ne!(SIG_SUSPEND, SIG_TICK);
        assert_ne!(SIG_RESUME, SIG_TICK);
    }
}
