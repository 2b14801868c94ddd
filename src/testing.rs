//! Test helpers: a scripted round-robin kernel and polling utilities

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::time::Instant;

use crate::kernel::Kernel;
use crate::task::TaskId;

/// Round-robin kernel with call counters
///
/// `select_next_task` moves to the next task in the list unless rotation
/// has been switched off.
pub(crate) struct RoundRobin {
    tasks: Vec<TaskId>,
    current: AtomicUsize,
    rotate: AtomicBool,
    selections: AtomicUsize,
    advances: AtomicUsize,
}

impl RoundRobin {
    pub(crate) fn new(tasks: &[TaskId]) -> Self {
        Self {
            tasks: tasks.to_vec(),
            current: AtomicUsize::new(0),
            rotate: AtomicBool::new(true),
            selections: AtomicUsize::new(0),
            advances: AtomicUsize::new(0),
        }
    }

    /// Kernel that keeps the same task current forever
    pub(crate) fn fixed(task: TaskId) -> Self {
        let kernel = Self::new(&[task]);
        kernel.rotate.store(false, Ordering::SeqCst);
        kernel
    }

    pub(crate) fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    pub(crate) fn advances(&self) -> usize {
        self.advances.load(Ordering::SeqCst)
    }
}

impl Kernel for RoundRobin {
    fn advance_time(&self) {
        self.advances.fetch_add(1, Ordering::SeqCst);
    }

    fn select_next_task(&self) {
        self.selections.fetch_add(1, Ordering::SeqCst);
        if self.rotate.load(Ordering::SeqCst) && !self.tasks.is_empty() {
            let next = (self.current.load(Ordering::SeqCst) + 1) % self.tasks.len();
            self.current.store(next, Ordering::SeqCst);
        }
    }

    fn current_task(&self) -> TaskId {
        self.tasks
            .get(self.current.load(Ordering::SeqCst))
            .copied()
            .unwrap_or(TaskId(0))
    }
}

/// Poll `condition` until it holds; panics after five seconds
pub(crate) fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
