//! Task identity and task thread handles
//!
//! A logical task is known to the kernel by an opaque [`TaskId`]. Each one
//! is emulated by a dedicated OS thread, tracked here as a [`TaskThread`].
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::signal;

/// Task entry function, run once on the task's own thread
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Opaque logical task identifier assigned by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

/// Protocol state of a task thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread spawned, not yet parked
    Created,
    /// Parked by its own first suspend, never resumed
    ParkedAwaitingFirstSuspend,
    /// The thread the emulated CPU is executing
    Running,
    /// Parked by a context switch
    Suspended,
    /// Entry function returned or the scheduler ended
    Terminated,
}

/// Raw POSIX thread handle
#[derive(Debug, Clone, Copy)]
pub(crate) struct OsThread(libc::pthread_t);

// SAFETY: a pthread_t is an identifier; it is only passed back to
// pthread_kill/pthread_equal, never dereferenced.
unsafe impl Send for OsThread {}
unsafe impl Sync for OsThread {}

impl OsThread {
    /// Handle of the calling thread
    pub(crate) fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        Self(unsafe { libc::pthread_self() })
    }

    pub(crate) fn raw(self) -> libc::pthread_t {
        self.0
    }
}

impl PartialEq for OsThread {
    fn eq(&self, other: &Self) -> bool {
        // SAFETY: pthread_equal only compares the two identifiers.
        unsafe { libc::pthread_equal(self.0, other.0) != 0 }
    }
}

impl Eq for OsThread {}

/// The OS thread emulating one task
///
/// Shared between the directory entry and the thread itself. The handle is
/// filled in by the thread on start-up; `arrived` is its parking sentinel.
#[derive(Debug, Default)]
pub(crate) struct TaskThread {
    os: OnceLock<OsThread>,
    arrived: AtomicBool,
}

impl TaskThread {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the calling thread as this task's OS thread
    pub(crate) fn attach_current(&self) {
        let _ = self.os.set(OsThread::current());
    }

    pub(crate) fn os(&self) -> Option<OsThread> {
        self.os.get().copied()
    }

    /// Is the caller running on this task's thread?
    pub(crate) fn is_current(&self) -> bool {
        signal::is_registered(self)
    }

    /// Both handles refer to the same OS thread
    pub(crate) fn same_os_thread(&self, other: &TaskThread) -> bool {
        if core::ptr::eq(self, other) {
            return true;
        }
        matches!((self.os(), other.os()), (Some(a), Some(b)) if a == b)
    }

    /// Has the thread reached its suspend handler since the last clear?
    pub(crate) fn has_arrived(&self) -> bool {
        self.arrived.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_arrived(&self) {
        self.arrived.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_arrived(&self) {
        self.arrived.store(true, Ordering::SeqCst);
    }
}
