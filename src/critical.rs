//! Critical section and interrupt-mask emulation
//!
//! Interrupts are a flag plus a nesting counter. Writing them never blocks
//! or wakes a thread: preemption is held off by the running token and the
//! deferred-yield rule, the flag is what task code observes.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What the caller of [`CriticalState::exit`] must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalExit {
    /// Still inside an outer critical section
    Nested,
    /// Nesting reached zero, interrupts re-enabled
    Enabled,
    /// Nesting reached zero with a yield pending: yield, then enable
    YieldPending,
}

/// Global interrupt flag, nesting depth and pending-yield request
#[derive(Debug)]
pub struct CriticalState {
    interrupts_enabled: AtomicBool,
    nesting: AtomicUsize,
    pending_yield: AtomicBool,
}

impl CriticalState {
    /// Interrupts enabled, nesting zero, nothing pending
    pub const fn new() -> Self {
        Self {
            interrupts_enabled: AtomicBool::new(true),
            nesting: AtomicUsize::new(0),
            pending_yield: AtomicBool::new(false),
        }
    }

    /// Disable interrupts and deepen the nesting
    pub fn enter(&self) {
        self.disable();
        self.nesting.fetch_add(1, Ordering::SeqCst);
    }

    /// Leave one level; unmatched exits clamp at zero
    pub fn exit(&self) -> CriticalExit {
        let previous = self
            .nesting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous > 1 {
            return CriticalExit::Nested;
        }

        if self.pending_yield.swap(false, Ordering::SeqCst) {
            CriticalExit::YieldPending
        } else {
            self.enable();
            CriticalExit::Enabled
        }
    }

    /// Disable interrupts, returning whether they were enabled
    pub fn set_interrupt_mask(&self) -> bool {
        self.interrupts_enabled.swap(false, Ordering::SeqCst)
    }

    /// Restore the state returned by [`CriticalState::set_interrupt_mask`]
    pub fn clear_interrupt_mask(&self, previous: bool) {
        self.interrupts_enabled.store(previous, Ordering::SeqCst);
    }

    /// Clear the interrupt flag
    pub fn disable(&self) {
        self.interrupts_enabled.store(false, Ordering::SeqCst);
    }

    /// Set the interrupt flag
    pub fn enable(&self) {
        self.interrupts_enabled.store(true, Ordering::SeqCst);
    }

    /// Interrupts are enabled iff the flag is set and nesting is zero
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst) && self.nesting() == 0
    }

    /// Current nesting depth
    pub fn nesting(&self) -> usize {
        self.nesting.load(Ordering::SeqCst)
    }

    /// Install a task's saved nesting on switch-in
    pub fn set_nesting(&self, nesting: usize) {
        self.nesting.store(nesting, Ordering::SeqCst);
    }

    /// Re-derive the flag from the nesting counter after a resume
    pub fn sync_with_nesting(&self) {
        let enabled = self.nesting() == 0;
        self.interrupts_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Zero the nesting and enable interrupts
    pub fn force_reset(&self) {
        self.set_nesting(0);
        self.enable();
    }

    /// Record a preemption request to honor when nesting returns to zero
    pub fn pend_yield(&self) {
        self.pending_yield.store(true, Ordering::SeqCst);
    }

    /// Is a deferred yield waiting for the outermost exit?
    pub fn yield_pending(&self) -> bool {
        self.pending_yield.load(Ordering::SeqCst)
    }
}

impl Default for CriticalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let critical = CriticalState::new();
        assert!(critical.interrupts_enabled());
        assert_eq!(critical.nesting(), 0);
        assert!(!critical.yield_pending());
    }

    #[test]
    fn test_nested_enter_exit() {
        let critical = CriticalState::new();
        critical.enter();
        critical.enter();
        assert_eq!(critical.nesting(), 2);
        assert!(!critical.interrupts_enabled());

        assert_eq!(critical.exit(), CriticalExit::Nested);
        assert!(!critical.interrupts_enabled());
        assert_eq!(critical.exit(), CriticalExit::Enabled);
        assert!(critical.interrupts_enabled());
    }

    #[test]
    fn test_unmatched_exit_clamps() {
        let critical = CriticalState::new();
        assert_eq!(critical.exit(), CriticalExit::Enabled);
        assert_eq!(critical.nesting(), 0);
        assert!(critical.interrupts_enabled());
    }

    #[test]
    fn test_pending_yield_waits_for_outermost_exit() {
        let critical = CriticalState::new();
        critical.enter();
        critical.enter();
        critical.pend_yield();

        assert_eq!(critical.exit(), CriticalExit::Nested);
        assert!(critical.yield_pending());
        assert_eq!(critical.exit(), CriticalExit::YieldPending);
        assert!(!critical.yield_pending());
        // The caller yields first; interrupts stay off until it enables them.
        assert!(!critical.interrupts_enabled());
    }

    #[test]
    fn test_mask_restores_previous_state() {
        let critical = CriticalState::new();
        let outer = critical.set_interrupt_mask();
        assert!(outer);
        let inner = critical.set_interrupt_mask();
        assert!(!inner);

        critical.clear_interrupt_mask(inner);
        assert!(!critical.interrupts_enabled());
        critical.clear_interrupt_mask(outer);
        assert!(critical.interrupts_enabled());
    }

    #[test]
    fn test_nesting_round_trip() {
        let critical = CriticalState::new();
        for saved in [0usize, 1, 3] {
            critical.set_nesting(saved);
            critical.sync_with_nesting();
            assert_eq!(critical.interrupts_enabled(), saved == 0);
            assert_eq!(critical.nesting(), saved);
        }
    }

    #[test]
    fn test_force_reset() {
        let critical = CriticalState::new();
        critical.enter();
        critical.enter();
        critical.force_reset();
        assert_eq!(critical.nesting(), 0);
        assert!(critical.interrupts_enabled());
    }
}
