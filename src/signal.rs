//! Suspend/resume signal protocol
//!
//! Every task thread except the running one is parked inside its own
//! SUSPEND handler, blocked in `sigwait` for RESUME. Parking is the only
//! way a task thread stops, and the parking handler is the only place the
//! running token changes hands:
//!
//! 1. a switch takes the token and resumes the incoming thread,
//! 2. it sends SUSPEND to the outgoing thread,
//! 3. the outgoing handler marks arrival and releases the token,
//! 4. the incoming thread sees the token released and returns to task code.
//!
//! Handlers reach their port through a thread-local registration set by
//! the task thread's trampoline. They only touch atomics, the spin-based
//! token and `sigwait`/`pthread_sigmask`.
//!
//! Author: Moroya Sakamoto

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::Ordering;
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread;

use libc::c_int;
use tracing::warn;

use crate::config::{SIG_RESUME, SIG_SUSPEND};
use crate::error::{PortError, PortResult};
use crate::port::Shared;
use crate::task::{OsThread, TaskThread};

thread_local! {
    static REGISTERED: Cell<(*const Shared, *const TaskThread)> =
        const { Cell::new((ptr::null(), ptr::null())) };
}

/// Binds the calling task thread to its port for the signal handlers
///
/// Cleared on drop. Must outlive every park of the thread.
pub(crate) struct Registration {
    _thread_bound: PhantomData<*const ()>,
}

impl Registration {
    pub(crate) fn new(shared: &Arc<Shared>, thread: &Arc<TaskThread>) -> Self {
        REGISTERED.with(|r| r.set((Arc::as_ptr(shared), Arc::as_ptr(thread))));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        REGISTERED.with(|r| r.set((ptr::null(), ptr::null())));
    }
}

/// Is `thread` the task thread registered on the calling OS thread?
pub(crate) fn is_registered(thread: &TaskThread) -> bool {
    REGISTERED.with(|r| ptr::eq(r.get().1, thread))
}

fn registered<'a>() -> Option<(&'a Shared, &'a TaskThread)> {
    let (shared, thread) = REGISTERED.with(Cell::get);
    if shared.is_null() || thread.is_null() {
        return None;
    }
    // SAFETY: both pointers come from Arcs owned by the trampoline frame that
    // holds the Registration, which outlives every handler run on this thread.
    Some(unsafe { (&*shared, &*thread) })
}

static HANDLERS: OnceLock<Result<(), (c_int, i32)>> = OnceLock::new();

/// Install the SUSPEND and RESUME handlers once per process
pub(crate) fn install_handlers() -> PortResult<()> {
    let installed = HANDLERS.get_or_init(|| {
        // SAFETY: both handlers are extern "C" functions with the plain
        // sa_handler signature.
        unsafe {
            install(SIG_SUSPEND, on_suspend)?;
            install(SIG_RESUME, on_resume)
        }
    });
    (*installed).map_err(|(signal, errno)| PortError::SignalSetup {
        signal,
        source: io::Error::from_raw_os_error(errno),
    })
}

unsafe fn install(signal: c_int, handler: extern "C" fn(c_int)) -> Result<(), (c_int, i32)> {
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = 0;
    // Nothing interrupts a handler; RESUME stays pending for sigwait.
    libc::sigfillset(&mut action.sa_mask);
    if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err((signal, errno));
    }
    Ok(())
}

fn signal_set(signals: &[c_int]) -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the set before sigaddset reads it.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for &signal in signals {
            libc::sigaddset(set.as_mut_ptr(), signal);
        }
        set.assume_init()
    }
}

fn change_mask(how: c_int, signals: &[c_int]) {
    let set = signal_set(signals);
    // SAFETY: `set` is initialized; the old mask is not requested.
    unsafe { libc::pthread_sigmask(how, &set, ptr::null_mut()) };
}

/// Let SUSPEND and RESUME reach the calling task thread
pub(crate) fn unblock_protocol_signals() {
    change_mask(libc::SIG_UNBLOCK, &[SIG_SUSPEND, SIG_RESUME]);
}

/// Block until `signal` is pending, consuming it
fn wait_for(signal: c_int) {
    let set = signal_set(&[signal]);
    let mut received: c_int = 0;
    // SAFETY: `set` is initialized and `received` is a valid out pointer.
    unsafe { libc::sigwait(&set, &mut received) };
}

/// Every signal blocked on the calling thread until dropped
pub(crate) struct BlockedSignals {
    previous: libc::sigset_t,
    _thread_bound: PhantomData<*const ()>,
}

impl BlockedSignals {
    pub(crate) fn all() -> Self {
        let mut full = MaybeUninit::<libc::sigset_t>::uninit();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigfillset initializes `full`; pthread_sigmask fills `previous`.
        unsafe {
            libc::sigfillset(full.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_SETMASK, full.as_ptr(), previous.as_mut_ptr());
            Self {
                previous: previous.assume_init(),
                _thread_bound: PhantomData,
            }
        }
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        // SAFETY: restores the mask saved on this same thread.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut()) };
    }
}

/// Park the start thread until the scheduler ends
///
/// The caller must have RESUME blocked (see [`BlockedSignals`]).
pub(crate) fn wait_for_end(shared: &Shared) {
    while !shared.scheduler_ended.load(Ordering::SeqCst) {
        wait_for(SIG_RESUME);
    }
}

extern "C" fn on_suspend(_signal: c_int) {
    let Some((shared, thread)) = registered() else {
        return;
    };

    thread.mark_arrived();
    // SAFETY: SUSPEND is only sent by the holder of the running token, and
    // parking hands the token on.
    unsafe { shared.token.force_unlock() };

    loop {
        wait_for(SIG_RESUME);
        // Retired threads never run task code again.
        if !shared.scheduler_ended.load(Ordering::SeqCst) {
            break;
        }
    }

    shared.await_handoff();
    shared.critical.sync_with_nesting();
}

extern "C" fn on_resume(_signal: c_int) {
    if let Some((shared, _)) = registered() {
        shared.await_handoff();
    }
}

impl Shared {
    /// Park `target`; returns once its handler has recorded arrival
    ///
    /// The caller must hold the running token, which the parked thread
    /// releases.
    pub(crate) fn suspend(&self, target: &TaskThread) {
        {
            let _coordination = self.coordination.lock();
            target.clear_arrived();
        }
        self.send(target, SIG_SUSPEND);

        while !target.has_arrived() {
            // A tick serviced on the target's own thread has SUSPEND masked:
            // it parks once the tick unwinds.
            if target.is_current() && self.servicing_tick.load(Ordering::SeqCst) {
                break;
            }
            thread::yield_now();
        }
    }

    /// Unpark `target` without waiting for it to run
    pub(crate) fn resume(&self, target: &TaskThread) {
        let _coordination = self.coordination.lock();
        if !target.is_current() {
            self.send(target, SIG_RESUME);
        }
    }

    /// Wake the thread blocked in `start_scheduler`
    pub(crate) fn wake_start_thread(&self) {
        let start = *self.start_thread.lock();
        if let Some(start) = start {
            self.kill(start, SIG_RESUME);
        }
    }

    fn send(&self, target: &TaskThread, signal: c_int) {
        let Some(os) = target.os() else {
            warn!(signal, "task thread has no OS handle yet");
            return;
        };
        let counter = if signal == SIG_SUSPEND {
            &self.counters.suspend_signals
        } else {
            &self.counters.resume_signals
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.kill(os, signal);
    }

    fn kill(&self, os: OsThread, signal: c_int) {
        // SAFETY: `os` names a thread that has not been joined; task threads
        // are detached and stay alive while their directory entry exists.
        let errno = unsafe { libc::pthread_kill(os.raw(), signal) };
        if errno != 0 {
            warn!(signal, errno, "failed to deliver signal to thread");
        }
    }

    /// Hold a freshly resumed thread until the switch that resumed it has
    /// released the running token
    ///
    /// SUSPEND is unmasked meanwhile so a new switch can park the thread
    /// again before it ever returns to task code.
    fn await_handoff(&self) {
        change_mask(libc::SIG_UNBLOCK, &[SIG_SUSPEND]);
        while self.token.is_locked() {
            thread::yield_now();
        }
        change_mask(libc::SIG_BLOCK, &[SIG_SUSPEND]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install_handlers().unwrap();
        install_handlers().unwrap();
    }

    #[test]
    fn test_unregistered_thread() {
        let thread = TaskThread::new();
        assert!(registered().is_none());
        assert!(!is_registered(&thread));
    }

    #[test]
    fn test_suspend_ignored_off_task_threads() {
        install_handlers().unwrap();
        // SAFETY: signals the calling thread, which has no registration.
        let errno = unsafe { libc::pthread_kill(libc::pthread_self(), SIG_SUSPEND) };
        assert_eq!(errno, 0);
    }

    #[test]
    fn test_blocked_signals_restored() {
        fn resume_blocked() -> bool {
            let mut current = MaybeUninit::<libc::sigset_t>::uninit();
            // SAFETY: queries the mask into `current`.
            unsafe {
                libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), current.as_mut_ptr());
                libc::sigismember(current.as_ptr(), SIG_RESUME) == 1
            }
        }

        let before = resume_blocked();
        {
            let _blocked = BlockedSignals::all();
            assert!(resume_blocked());
        }
        assert_eq!(resume_blocked(), before);
    }
}
