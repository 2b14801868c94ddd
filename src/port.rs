//! Port: the scheduler context object
//!
//! Owns the thread directory, the running token, the interrupt emulation
//! and the kernel callbacks, and sequences the task lifecycle:
//! creation (spawn a parked thread), binding, scheduler start and end.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use libc::c_int;
use spin::mutex::{SpinMutex, SpinMutexGuard};
use spin::relax::Yield;
use tracing::{debug, error, info, trace, warn};

use crate::config::PortConfig;
use crate::critical::{CriticalExit, CriticalState};
use crate::directory::ThreadDirectory;
use crate::error::{PortError, PortResult};
use crate::kernel::Kernel;
use crate::signal::{self, BlockedSignals, Registration};
use crate::switch::SwitchTrigger;
use crate::task::{OsThread, TaskEntry, TaskId, TaskThread, ThreadState};
use crate::timer;

/// The running token: whoever holds it owns the emulated CPU and the
/// directory
pub(crate) type RunToken = SpinMutex<ThreadDirectory, Yield>;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) ticks: AtomicU64,
    pub(crate) context_switches: AtomicU64,
    pub(crate) suspend_signals: AtomicU64,
    pub(crate) resume_signals: AtomicU64,
}

/// State shared by the port handle, task threads and signal handlers
pub(crate) struct Shared {
    pub(crate) config: PortConfig,
    pub(crate) kernel: Box<dyn Kernel>,
    pub(crate) token: RunToken,
    /// Serializes SUSPEND/RESUME issuance
    pub(crate) coordination: SpinMutex<(), Yield>,
    pub(crate) critical: CriticalState,
    pub(crate) servicing_tick: AtomicBool,
    pub(crate) first_task_started: AtomicBool,
    pub(crate) scheduler_ended: AtomicBool,
    /// Thread blocked in `start_scheduler`
    pub(crate) start_thread: SpinMutex<Option<OsThread>, Yield>,
    pub(crate) counters: Counters,
}

impl Shared {
    /// Free the directory entry of a finished task thread
    ///
    /// A task that dies with interrupts disabled would lock the system up,
    /// so its nesting is discarded and interrupts re-enabled.
    pub(crate) fn release_thread(&self, thread: &TaskThread) {
        let mut directory = self.token.lock();
        let Some(saved) = directory.release(thread) else {
            return;
        };
        let nesting = if thread.is_current() {
            self.critical.nesting()
        } else {
            saved
        };
        if nesting > 0 {
            warn!(nesting, "released task held interrupts disabled, re-enabling");
            self.critical.force_reset();
        }
    }
}

/// Execution statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Ticks serviced
    pub ticks: u64,
    /// Completed switches between task threads
    pub context_switches: u64,
    /// SUSPEND signals sent
    pub suspend_signals: u64,
    /// RESUME signals sent to task threads
    pub resume_signals: u64,
    /// Directory slots holding a thread
    pub tasks: usize,
}

/// Single-core scheduler port on POSIX threads
///
/// Cheap to clone; every clone drives the same emulated CPU.
#[derive(Clone)]
pub struct Port {
    shared: Arc<Shared>,
}

impl Port {
    /// Create a port driven by `kernel`
    pub fn new<K: Kernel + 'static>(config: PortConfig, kernel: K) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                kernel: Box::new(kernel),
                token: SpinMutex::new(ThreadDirectory::with_capacity(config.max_tasks)),
                coordination: SpinMutex::new(()),
                critical: CriticalState::new(),
                servicing_tick: AtomicBool::new(false),
                first_task_started: AtomicBool::new(false),
                scheduler_ended: AtomicBool::new(false),
                start_thread: SpinMutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Configuration the port was built with
    pub fn config(&self) -> &PortConfig {
        &self.shared.config
    }

    /// Create a task thread and park it before it runs `entry`
    ///
    /// Returns the directory slot once the new thread is confirmed parked.
    /// The kernel then names the task with [`Port::bind_task`].
    pub fn initialize_task<F>(&self, entry: F) -> PortResult<usize>
    where
        F: FnOnce() + Send + 'static,
    {
        signal::install_handlers()?;
        self.enter_critical();
        let created = self.spawn_parked(Box::new(entry));
        self.exit_critical();
        created
    }

    fn spawn_parked(&self, entry: TaskEntry) -> PortResult<usize> {
        let task_thread = Arc::new(TaskThread::new());
        let slot = {
            let mut directory = self.shared.token.lock();
            let slot = directory.allocate_slot()?;
            directory.claim(slot, Arc::clone(&task_thread));
            slot
        };

        let mut builder = thread::Builder::new().name(format!("task-{slot}"));
        if let Some(bytes) = self.shared.config.stack_size {
            builder = builder.stack_size(bytes);
        }
        let shared = Arc::clone(&self.shared);
        let parked = Arc::clone(&task_thread);
        if let Err(err) = builder.spawn(move || run_task(shared, parked, entry)) {
            self.shared.token.lock().release(&task_thread);
            return Err(PortError::Spawn(err));
        }

        while !task_thread.has_arrived() {
            thread::yield_now();
        }
        self.shared
            .token
            .lock()
            .set_state(&task_thread, ThreadState::ParkedAwaitingFirstSuspend);
        debug!(slot, "task thread parked");
        Ok(slot)
    }

    /// Name the most recently created task thread
    pub fn bind_task(&self, task: TaskId) {
        let mut directory = self.shared.token.lock();
        let slot = directory.last_created();
        if directory.bind(slot, task) {
            debug!(slot, ?task, "task bound");
        } else {
            warn!(slot, ?task, "no task thread awaiting a binding");
        }
    }

    /// Run the first task and block until [`Port::end_scheduler`]
    pub fn start_scheduler(&self) -> PortResult<()> {
        let shared = &self.shared;
        if shared.scheduler_ended.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.first_task_started.load(Ordering::SeqCst) {
            return Err(PortError::AlreadyStarted);
        }
        signal::install_handlers()?;

        *shared.start_thread.lock() = Some(OsThread::current());
        let blocked = BlockedSignals::all();

        let first = {
            let mut directory = shared.token.lock();
            directory.reset_nesting();
            let current = shared.kernel.current_task();
            let first = directory
                .lookup_thread(current)
                .ok_or(PortError::NoRunnableTask(current))?;
            directory.set_state(&first, ThreadState::Running);
            info!(?current, tasks = directory.occupied(), "starting scheduler");
            first
        };

        shared.critical.set_nesting(0);
        shared.critical.enable();
        shared.first_task_started.store(true, Ordering::SeqCst);
        shared.resume(&first);

        signal::wait_for_end(shared);
        drop(blocked);
        info!("scheduler stopped");
        Ok(())
    }

    /// Retire every task thread and unblock [`Port::start_scheduler`]
    ///
    /// Task threads cannot be cancelled, so they are parked for good and
    /// never run task code again. Called from a task, this does not return.
    ///
    /// Retired threads are never reclaimed: each ended port keeps its task
    /// OS threads, their stacks and its shared state alive until the
    /// process exits.
    pub fn end_scheduler(&self) {
        let shared = &self.shared;
        let mut directory = shared.token.lock();
        if shared.scheduler_ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = directory.lookup_thread(shared.kernel.current_task());
        let retired = directory.drain();
        info!(threads = retired.len(), "ending scheduler");

        match running {
            Some(running) if shared.first_task_started.load(Ordering::SeqCst) => {
                // The parking thread releases the token.
                SpinMutexGuard::leak(directory);
                if running.is_current() {
                    shared.wake_start_thread();
                    shared.suspend(&running);
                } else {
                    shared.suspend(&running);
                    shared.wake_start_thread();
                }
            }
            _ => {
                drop(directory);
                shared.wake_start_thread();
            }
        }
    }

    /// Tick entry point for the external timing source
    pub fn on_tick(&self, signal: c_int) {
        let shared = &self.shared;
        if !shared.first_task_started.load(Ordering::SeqCst)
            || shared.scheduler_ended.load(Ordering::SeqCst)
        {
            return;
        }
        trace!(signal, "tick");
        shared.switch_tasks(SwitchTrigger::Tick);
    }

    /// Voluntary preemption point
    pub fn yield_now(&self) {
        self.shared.switch_tasks(SwitchTrigger::Yield);
    }

    /// Ask for a yield at the end of the current critical section
    ///
    /// For contexts where switching right away is unsafe, such as another
    /// signal handler.
    pub fn request_yield_from_handler(&self) {
        self.shared.critical.pend_yield();
    }

    /// Disable interrupts and deepen the critical nesting
    ///
    /// The nesting changes under the running token, so a tick switch never
    /// sees it mid-update and never parks a thread between its check and
    /// the update.
    pub fn enter_critical(&self) {
        let _token = self.shared.token.lock();
        self.shared.critical.enter();
    }

    /// Leave a critical section, honoring a pending yield at depth zero
    pub fn exit_critical(&self) {
        let exit = {
            let _token = self.shared.token.lock();
            self.shared.critical.exit()
        };
        match exit {
            CriticalExit::Nested | CriticalExit::Enabled => {}
            CriticalExit::YieldPending => {
                self.yield_now();
                self.shared.critical.enable();
            }
        }
    }

    /// Disable interrupts, returning the previous state
    pub fn set_interrupt_mask(&self) -> bool {
        self.shared.critical.set_interrupt_mask()
    }

    /// Restore the state returned by [`Port::set_interrupt_mask`]
    pub fn clear_interrupt_mask(&self, previous: bool) {
        self.shared.critical.clear_interrupt_mask(previous);
    }

    /// Are interrupts enabled (flag set and nesting zero)?
    pub fn interrupts_enabled(&self) -> bool {
        self.shared.critical.interrupts_enabled()
    }

    /// Critical nesting of the running task
    pub fn critical_nesting(&self) -> usize {
        self.shared.critical.nesting()
    }

    /// Forced mid-run deletion has no defined behavior on this port
    pub fn delete_task(&self, task: TaskId) -> PortResult<()> {
        warn!(?task, "forced task termination requested");
        Err(PortError::Unsupported("forced task termination"))
    }

    /// Coarse process CPU time, informational only
    pub fn query_elapsed_runtime(&self) -> u64 {
        timer::query_elapsed_runtime()
    }

    /// Protocol state of a directory slot (None if never used)
    pub fn slot_state(&self, slot: usize) -> Option<ThreadState> {
        self.shared.token.lock().state(slot)
    }

    /// Has the first task been started, and the scheduler not ended?
    pub fn is_running(&self) -> bool {
        self.shared.first_task_started.load(Ordering::SeqCst)
            && !self.shared.scheduler_ended.load(Ordering::SeqCst)
    }

    /// Snapshot of the execution counters
    pub fn stats(&self) -> PortStats {
        let counters = &self.shared.counters;
        PortStats {
            ticks: counters.ticks.load(Ordering::Relaxed),
            context_switches: counters.context_switches.load(Ordering::Relaxed),
            suspend_signals: counters.suspend_signals.load(Ordering::Relaxed),
            resume_signals: counters.resume_signals.load(Ordering::Relaxed),
            tasks: self.shared.token.lock().occupied(),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

/// Task thread body: park, then run the entry once resumed
fn run_task(shared: Arc<Shared>, task_thread: Arc<TaskThread>, entry: TaskEntry) {
    task_thread.attach_current();
    let _registration = Registration::new(&shared, &task_thread);
    signal::unblock_protocol_signals();

    // Taken here, released by the first park.
    SpinMutexGuard::leak(shared.token.lock());
    shared.suspend(&task_thread);

    if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
        error!("task entry panicked");
    }
    shared.release_thread(&task_thread);
}
