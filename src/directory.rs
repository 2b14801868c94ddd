//! Thread directory: task id → OS thread table
//!
//! Fixed-capacity slot table, sized once at construction. The directory
//! lives inside the running token, so every access is serialized by the
//! context-switch protocol.
//!
//! Author: Moroya Sakamoto

use std::sync::Arc;

use crate::error::{PortError, PortResult};
use crate::task::{TaskId, TaskThread, ThreadState};

/// One task slot
#[derive(Debug, Default)]
struct DirectoryEntry {
    /// OS thread (None = free slot)
    thread: Option<Arc<TaskThread>>,
    /// Bound logical task (None while mid-creation)
    task: Option<TaskId>,
    /// Critical nesting saved when the task was switched out
    nesting: usize,
    /// Protocol state (None = never used)
    state: Option<ThreadState>,
}

impl DirectoryEntry {
    fn holds(&self, thread: &TaskThread) -> bool {
        self.thread
            .as_deref()
            .is_some_and(|held| core::ptr::eq(held, thread))
    }

    fn clear(&mut self) {
        self.thread = None;
        self.task = None;
        self.nesting = 0;
    }
}

/// Slot table mapping logical tasks to their OS threads
#[derive(Debug)]
pub(crate) struct ThreadDirectory {
    entries: Vec<DirectoryEntry>,
    /// Slot most recently populated by task creation
    last_created: usize,
}

impl ThreadDirectory {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| DirectoryEntry::default()).collect(),
            last_created: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// First slot without an OS thread
    pub(crate) fn allocate_slot(&self) -> PortResult<usize> {
        self.entries
            .iter()
            .position(|entry| entry.thread.is_none())
            .ok_or(PortError::NoFreeSlot {
                capacity: self.capacity(),
            })
    }

    /// Give a free slot to a thread about to be spawned
    pub(crate) fn claim(&mut self, slot: usize, thread: Arc<TaskThread>) {
        let entry = &mut self.entries[slot];
        entry.thread = Some(thread);
        entry.task = None;
        entry.nesting = 0;
        entry.state = Some(ThreadState::Created);
        self.last_created = slot;
    }

    pub(crate) fn last_created(&self) -> usize {
        self.last_created
    }

    /// Attach a logical id to a slot's thread
    ///
    /// Other entries are reconciled here: a creation that was never bound
    /// (the kernel rejected the task) and an entry holding the same OS
    /// thread under a different id are both cleared. Returns false if the
    /// slot is free.
    pub(crate) fn bind(&mut self, slot: usize, task: TaskId) -> bool {
        let Some(thread) = self.entries.get(slot).and_then(|e| e.thread.clone()) else {
            return false;
        };
        self.entries[slot].task = Some(task);

        for (index, entry) in self.entries.iter_mut().enumerate() {
            if index == slot || entry.task == Some(task) {
                continue;
            }
            let Some(other) = entry.thread.as_deref() else {
                continue;
            };
            if entry.task.is_none() {
                entry.clear();
                entry.state = Some(ThreadState::Terminated);
            } else if other.same_os_thread(&thread) {
                entry.clear();
            }
        }
        true
    }

    /// Thread bound to `task`, if any
    pub(crate) fn lookup_thread(&self, task: TaskId) -> Option<Arc<TaskThread>> {
        self.entries
            .iter()
            .find(|entry| entry.task == Some(task))
            .and_then(|entry| entry.thread.clone())
    }

    /// Saved nesting of `thread` (0 if unknown)
    pub(crate) fn nesting(&self, thread: &TaskThread) -> usize {
        self.entries
            .iter()
            .find(|entry| entry.holds(thread))
            .map_or(0, |entry| entry.nesting)
    }

    pub(crate) fn set_nesting(&mut self, thread: &TaskThread, nesting: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.holds(thread)) {
            entry.nesting = nesting;
        }
    }

    /// Zero every saved nesting (scheduler start)
    pub(crate) fn reset_nesting(&mut self) {
        for entry in &mut self.entries {
            entry.nesting = 0;
        }
    }

    pub(crate) fn set_state(&mut self, thread: &TaskThread, state: ThreadState) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.holds(thread)) {
            entry.state = Some(state);
        }
    }

    /// Protocol state of a slot
    pub(crate) fn state(&self, slot: usize) -> Option<ThreadState> {
        self.entries.get(slot).and_then(|entry| entry.state)
    }

    /// Free the slot held by `thread`, returning its saved nesting
    pub(crate) fn release(&mut self, thread: &TaskThread) -> Option<usize> {
        let entry = self.entries.iter_mut().find(|entry| entry.holds(thread))?;
        let nesting = entry.nesting;
        entry.clear();
        entry.state = Some(ThreadState::Terminated);
        Some(nesting)
    }

    /// Free every occupied slot, returning the threads that held them
    pub(crate) fn drain(&mut self) -> Vec<Arc<TaskThread>> {
        self.entries
            .iter_mut()
            .filter_map(|entry| {
                let thread = entry.thread.take()?;
                entry.clear();
                entry.state = Some(ThreadState::Terminated);
                Some(thread)
            })
            .collect()
    }

    /// Number of slots holding a thread
    pub(crate) fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| e.thread.is_some()).count()
    }
}
