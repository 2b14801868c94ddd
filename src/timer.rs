//! Tick source and runtime query
//!
//! The port does not own a timer. An external source calls
//! [`Port::on_tick`]; [`TickDriver`] is a ready-made one that does so from
//! a dedicated thread every `tick_period`.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::SIG_TICK;
use crate::error::{PortError, PortResult};
use crate::port::Port;

#[derive(Debug, Default)]
struct DriverState {
    stop: AtomicBool,
    ticks: AtomicU64,
}

/// Periodic tick thread
///
/// Stops and joins on drop.
pub struct TickDriver {
    state: Arc<DriverState>,
    handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    /// Spawn the tick thread for `port`
    pub fn start(port: Port) -> PortResult<Self> {
        let state = Arc::new(DriverState::default());
        let period = port.config().tick_period;
        let driver_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("tick".into())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while !driver_state.stop.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now < next {
                        thread::park_timeout(next - now);
                        continue;
                    }
                    port.on_tick(SIG_TICK);
                    driver_state.ticks.fetch_add(1, Ordering::Relaxed);
                    next += period;
                }
            })
            .map_err(PortError::Spawn)?;

        debug!(?period, "tick driver started");
        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Ticks delivered so far
    pub fn ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// Stop the driver, returning the number of ticks delivered
    pub fn stop(mut self) -> u64 {
        self.shutdown();
        self.ticks()
    }

    fn shutdown(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("tick thread panicked");
            }
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// User CPU time of the process in clock ticks
///
/// Informational only; the kernel's run-time statistics should not rely
/// on its resolution.
pub fn query_elapsed_runtime() -> u64 {
    let mut times = libc::tms {
        tms_utime: 0,
        tms_stime: 0,
        tms_cutime: 0,
        tms_cstime: 0,
    };
    // SAFETY: `times` is a valid out pointer.
    unsafe { libc::times(&mut times) };
    u64::try_from(times.tms_utime).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::task::TaskId;
    use crate::testing::{wait_until, RoundRobin};

    #[test]
    fn test_driver_ticks_and_stops() {
        let port = Port::new(PortConfig::testing(), RoundRobin::new(&[TaskId(1)]));
        let driver = TickDriver::start(port.clone()).unwrap();
        wait_until("three ticks", || driver.ticks() >= 3);

        let delivered = driver.stop();
        assert!(delivered >= 3);
        // Not started: ticks reach the port but are ignored.
        assert_eq!(port.stats().ticks, 0);
    }

    #[test]
    fn test_driver_stops_on_drop() {
        let port = Port::new(PortConfig::testing(), RoundRobin::new(&[]));
        let driver = TickDriver::start(port).unwrap();
        drop(driver);
    }

    #[test]
    fn test_driver_preempts_running_tasks() {
        let kernel = Arc::new(RoundRobin::new(&[TaskId(1), TaskId(2)]));
        let port = Port::new(PortConfig::testing(), Arc::clone(&kernel));
        let counters = [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))];
        for (index, counter) in counters.iter().enumerate() {
            let counter = Arc::clone(counter);
            port.initialize_task(move || loop {
                counter.fetch_add(1, Ordering::SeqCst);
                core::hint::spin_loop();
            })
            .unwrap();
            port.bind_task(TaskId(index + 1));
        }

        let runner = {
            let port = port.clone();
            thread::spawn(move || port.start_scheduler())
        };
        let driver = TickDriver::start(port.clone()).unwrap();
        wait_until("both tasks to run", || {
            counters.iter().all(|c| c.load(Ordering::SeqCst) > 0)
        });
        driver.stop();

        assert!(port.stats().context_switches >= 1);
        port.end_scheduler();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_elapsed_runtime_monotonic() {
        let before = query_elapsed_runtime();
        let mut x = 0u64;
        for i in 0..1_000_000u64 {
            x = x.wrapping_add(core::hint::black_box(i));
        }
        core::hint::black_box(x);
        assert!(query_elapsed_runtime() >= before);
    }
}
