//! Port errors
//!
//! Only task creation and scheduler start can fail from the caller's
//! point of view. Signal delivery failures are logged, not returned.
//!
//! Author: Moroya Sakamoto

use std::io;

use libc::c_int;
use thiserror::Error;

use crate::task::TaskId;

/// Result alias used throughout the port
pub type PortResult<T> = Result<T, PortError>;

/// Errors reported by the port layer
#[derive(Error, Debug)]
pub enum PortError {
    /// Every directory slot already owns a task thread.
    ///
    /// Capacity must be sized to the maximum task count; the directory is
    /// left untouched.
    #[error("no free task slot (capacity {capacity})")]
    NoFreeSlot {
        /// Directory capacity
        capacity: usize,
    },

    /// The OS refused to create the task thread.
    #[error("failed to spawn task thread: {0}")]
    Spawn(#[source] io::Error),

    /// Installing the SUSPEND or RESUME handler failed.
    #[error("failed to install handler for signal {signal}: {source}")]
    SignalSetup {
        /// Signal number
        signal: c_int,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// `start_scheduler` was called a second time.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// The kernel's current task has no thread to run.
    #[error("current task {0:?} has no thread")]
    NoRunnableTask(TaskId),

    /// The operation has no defined behavior on this port.
    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PortError::NoFreeSlot { capacity: 4 };
        assert_eq!(err.to_string(), "no free task slot (capacity 4)");

        let err = PortError::NoRunnableTask(TaskId(7));
        assert_eq!(err.to_string(), "current task TaskId(7) has no thread");

        let err = PortError::Unsupported("forced task termination");
        assert_eq!(err.to_string(), "forced task termination is not supported");
    }

    #[test]
    fn test_signal_setup_source() {
        use std::error::Error as _;

        let err = PortError::SignalSetup {
            signal: libc::SIGUSR1,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(err.source().is_some());
    }
}
