//! posix-rtos-port: a single-core RTOS port on POSIX threads
//!
//! Emulates one priority-preemptive CPU with many OS threads, exactly one
//! of which executes task code at any time:
//! - One OS thread per task, parked in a signal handler when not running
//! - SUSPEND/RESUME signals hand the running token from thread to thread
//! - Critical sections and the interrupt mask are emulated with a flag and
//!   a nesting counter saved per task across switches
//! - Task selection stays with the kernel, consumed through [`Kernel`]
//!
//! Author: Moroya Sakamoto

pub mod config;
pub mod critical;
pub(crate) mod directory;
pub mod error;
pub mod kernel;
pub mod port;
pub(crate) mod signal;
pub mod switch;
pub mod task;
pub mod timer;

#[cfg(test)]
mod testing;

pub use config::{
    PortConfig, DEFAULT_MAX_TASKS, DEFAULT_TICK_PERIOD, SIG_RESUME, SIG_SUSPEND, SIG_TICK,
};
pub use critical::{CriticalExit, CriticalState};
pub use error::{PortError, PortResult};
pub use kernel::Kernel;
pub use port::{Port, PortStats};
pub use switch::SwitchTrigger;
pub use task::{TaskEntry, TaskId, ThreadState};
pub use timer::{query_elapsed_runtime, TickDriver};
