//! Context-switch sequencer
//!
//! Ticks and yields both end up here. The switch runs with the running
//! token held: it asks the kernel for the next task, moves the critical
//! nesting from the outgoing to the incoming task, resumes the incoming
//! thread and parks the outgoing one. The parked thread's handler releases
//! the token, which is what lets the incoming thread return to task code.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::Ordering;

use spin::mutex::SpinMutexGuard;
use tracing::{trace, warn};

use crate::port::Shared;
use crate::task::ThreadState;

/// What triggered a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTrigger {
    /// Periodic tick: advances kernel time, selects only with preemption on
    Tick,
    /// Voluntary yield: always selects
    Yield,
}

impl Shared {
    pub(crate) fn switch_tasks(&self, trigger: SwitchTrigger) {
        self.switch_locked(trigger);
        if trigger == SwitchTrigger::Tick {
            self.servicing_tick.store(false, Ordering::SeqCst);
        }
    }

    fn switch_locked(&self, trigger: SwitchTrigger) {
        let mut directory = self.token.lock();
        if trigger == SwitchTrigger::Tick {
            self.servicing_tick.store(true, Ordering::SeqCst);
        }
        if self.scheduler_ended.load(Ordering::SeqCst)
            || !self.first_task_started.load(Ordering::SeqCst)
        {
            return;
        }

        let outgoing = directory.lookup_thread(self.kernel.current_task());
        match trigger {
            SwitchTrigger::Tick => {
                self.kernel.advance_time();
                self.counters.ticks.fetch_add(1, Ordering::Relaxed);
                let nesting = self.critical.nesting();
                if nesting > 0 {
                    // Switching now would break the critical section.
                    trace!(nesting, "tick inside critical section, yield deferred");
                    self.critical.pend_yield();
                    return;
                }
                if self.config.preemption {
                    self.kernel.select_next_task();
                }
            }
            SwitchTrigger::Yield => self.kernel.select_next_task(),
        }
        let next = self.kernel.current_task();
        let incoming = directory.lookup_thread(next);

        match (outgoing, incoming) {
            (Some(outgoing), Some(incoming)) if !outgoing.same_os_thread(&incoming) => {
                directory.set_nesting(&outgoing, self.critical.nesting());
                directory.set_state(&outgoing, ThreadState::Suspended);
                self.critical.set_nesting(directory.nesting(&incoming));
                directory.set_state(&incoming, ThreadState::Running);
                self.counters.context_switches.fetch_add(1, Ordering::Relaxed);
                trace!(?trigger, ?next, "switching task threads");

                // The outgoing thread releases the token when it parks.
                SpinMutexGuard::leak(directory);
                self.resume(&incoming);
                self.suspend(&outgoing);
            }
            (None, Some(incoming)) => {
                // Outgoing task already finished; nothing to park.
                self.critical.set_nesting(directory.nesting(&incoming));
                directory.set_state(&incoming, ThreadState::Running);
                self.counters.context_switches.fetch_add(1, Ordering::Relaxed);
                trace!(?trigger, ?next, "resuming task thread");
                self.resume(&incoming);
            }
            (Some(_), None) => {
                warn!(?trigger, ?next, "selected task has no thread, keeping the running one");
            }
            _ => {}
        }
    }
}
