//! # The Loom of Fate
//!
//! A cooperative lightweight-thread runtime.
//! The Loom does not preempt; it negotiates.
//! Many threads of fate are woven onto the one host thread that calls
//! [`start`], each with its own stack and its own registers, and each gives
//! way to the next only when it chooses to.
//!
//! ## Philosophy
//! Every thread is a thread of fate, weaving its purpose into the tapestry
//! of the program. The Loom's role is to keep the weave moving: no thread is
//! ever forgotten, and no thread that has ended is ever lost before someone
//! has [`wait`]ed for it.
//!
//! ## Architecture
//! - Cooperative scheduling: control changes hands only in [`yield_now`]
//!   (directly, or through [`exit`], [`wait`] and [`start`])
//! - Thread states: `Live` and `Terminated(code)`
//! - A replaceable [`Scheduler`], round robin by default
//! - Terminated threads keep their stack until they are reaped, because
//!   they are still running on it when they exit
//!
//! A thread that never yields starves everyone else; that is the price of
//! cooperation and the Loom cannot prevent it.
//!
//! ```no_run
//! let id = loom_of_fate::create(|| {
//!     loom_of_fate::yield_now();
//!     7
//! })
//! .expect("no stack");
//!
//! loom_of_fate::start().expect("already started");
//! assert_eq!(loom_of_fate::wait(), Some((id, 7)));
//! assert_eq!(loom_of_fate::wait(), None);
//! ```

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("the Loom of Fate weaves only on x86-64 System V hosts");

pub mod context;
pub mod error;
mod loom;
pub mod round_robin;
pub mod scheduler;
pub mod stack;
pub mod thread;

pub use error::{LwpError, Result};
pub use round_robin::RoundRobin;
pub use scheduler::{LoomStats, Scheduler};
pub use thread::{ThreadId, ThreadInfo, ThreadStatus, NO_THREAD, ORIGINAL_THREAD};

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::process;

use log::{error, info};

use loom::{Loom, Reap, Termination, ThreadBody};

/// Exit status recorded for a thread whose body panicked
pub const PANIC_EXIT_STATUS: i32 = 101;

thread_local! {
    // One Loom per host thread: the threads woven on it never leave it.
    static LOOM: RefCell<Option<Loom>> = const { RefCell::new(None) };
}

/// Run `f` against this host thread's Loom, creating it on first use
///
/// The borrow ends before `f`'s result is returned, so no caller may switch
/// threads from inside `f`.
fn with_loom<R>(f: impl FnOnce(&mut Loom) -> R) -> R {
    LOOM.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.get_or_insert_with(Loom::new))
    })
}

/// Start weaving
///
/// Wraps the calling execution as the original thread (id
/// [`ORIGINAL_THREAD`], running on the host stack), installs round robin if
/// no scheduler has been set, and immediately yields to the first created
/// thread. Returns when the rotation comes back to the caller.
///
/// # Errors
/// [`LwpError::AlreadyStarted`] if this host thread has already started.
pub fn start() -> Result<()> {
    with_loom(Loom::adopt_original)?;
    info!("the loom begins to weave");
    yield_now();
    Ok(())
}

/// Create a new thread running `body`
///
/// The thread is admitted to the scheduler immediately but does not run
/// until some thread yields to it. Returning from `body` is the same as
/// calling [`exit`] with the returned value.
///
/// # Errors
/// [`LwpError::ResourceExhausted`] if no stack could be mapped. Nothing else
/// changes in that case.
pub fn create<F>(body: F) -> Result<ThreadId>
where
    F: FnOnce() -> i32 + 'static,
{
    spawn(Box::new(body), None)
}

/// Create a new thread running `function(argument)`
pub fn create_with<A: 'static>(function: fn(A) -> i32, argument: A) -> Result<ThreadId> {
    create(move || function(argument))
}

/// Create a new thread with a stack of at least `stack_size` bytes
pub fn create_with_stack_size<F>(body: F, stack_size: usize) -> Result<ThreadId>
where
    F: FnOnce() -> i32 + 'static,
{
    spawn(Box::new(body), Some(stack_size))
}

fn spawn(body: ThreadBody, stack_size: Option<usize>) -> Result<ThreadId> {
    with_loom(|loom| loom.spawn(body, stack_size))
}

/// Where every created thread begins, by way of the trampoline
pub(crate) extern "C" fn thread_entry(payload: usize) -> ! {
    // SAFETY: `payload` is the `Box<ThreadBody>` leaked by `Loom::spawn`,
    // and a thread enters here exactly once.
    let body = unsafe { Box::from_raw(payload as *mut ThreadBody) };

    let status = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(status) => status,
        Err(_) => {
            error!(
                "thread {} panicked; exiting with status {}",
                current_thread().unwrap_or(NO_THREAD),
                PANIC_EXIT_STATUS
            );
            PANIC_EXIT_STATUS
        }
    };

    exit(status)
}

/// Yield the current thread
///
/// Hands control to whichever thread the scheduler picks. If there is none
/// besides the caller, or the Loom has not started, returns at once.
/// Otherwise returns when the caller's turn comes around again.
pub fn yield_now() {
    // The Loom must be released before switching: the next thread will
    // borrow it as soon as it runs.
    let switch = with_loom(Loom::prepare_yield);

    if let Some((from, to)) = switch {
        // SAFETY: both contexts live in boxed registry entries that cannot
        // be reaped while one is running and the other is live.
        unsafe { context::switch_context(from, to) };
    }
}

/// End the current thread with `status & 0xFF`
///
/// The thread leaves the schedule but stays registered until a [`wait`]
/// reaps it. If it was the last schedulable thread, the process exits with
/// status 0. Called on a host thread that never started the Loom, the
/// process exits with `status & 0xFF`.
pub fn exit(status: i32) -> ! {
    match with_loom(|loom| loom.terminate_current(status)) {
        Termination::Detached => process::exit(status & 0xFF),
        Termination::LastThread => {
            info!("no runnable threads remain; the loom falls silent");
            process::exit(0)
        }
        Termination::Continue => yield_now(),
    }

    error!("a terminated thread was resumed");
    process::abort()
}

/// Wait for a thread to terminate and reap it
///
/// Returns the id and exit code of the oldest terminated thread, releasing
/// its stack. If nothing has terminated, yields until something does, or
/// returns `None` as soon as no other thread is left that could terminate.
/// The original thread is never reaped. Before [`start`], returns `None`.
pub fn wait() -> Option<(ThreadId, i32)> {
    loop {
        match with_loom(Loom::reap_one) {
            Reap::Reaped(thread) => {
                let id = thread.id();
                let code = thread.status().exit_code().map_or(0, i32::from);
                drop(thread);
                return Some((id, code));
            }
            Reap::Quiescent => return None,
            Reap::Pending => yield_now(),
        }
    }
}

/// Install a new scheduler
///
/// The new scheduler is initialized and every live thread is admitted to it
/// in creation order; the old one is shut down and dropped. No thread is
/// lost in the exchange.
pub fn set_scheduler(scheduler: Box<dyn Scheduler>) {
    with_loom(|loom| loom.replace_scheduler(scheduler));
}

/// Inspect the active scheduler
///
/// Installs round robin first if none has been set. `f` must not call back
/// into the Loom.
pub fn get_scheduler<R>(f: impl FnOnce(&dyn Scheduler) -> R) -> R {
    with_loom(|loom| f(loom.scheduler()))
}

/// Look up a thread by id
///
/// Returns `None` for ids that were never issued or have been reaped.
pub fn tid_to_thread(thread_id: ThreadId) -> Option<ThreadInfo> {
    with_loom(|loom| loom.thread_info(thread_id))
}

/// The status of a registered thread
///
/// # Errors
/// [`LwpError::InvalidThread`] if the id is unknown or already reaped.
pub fn status_of(thread_id: ThreadId) -> Result<ThreadStatus> {
    tid_to_thread(thread_id)
        .map(|info| info.status)
        .ok_or(LwpError::InvalidThread(thread_id))
}

/// Get the current thread ID
pub fn current_thread() -> Option<ThreadId> {
    with_loom(|loom| loom.current_thread_id())
}

/// Get Loom statistics
pub fn stats() -> LoomStats {
    with_loom(Loom::stats)
}

/// Override the stack size given to threads created without a size hint
///
/// `None` restores the default derived from the host stack limit. Applies
/// to threads created afterwards on this host thread.
pub fn set_default_stack_size(size: Option<usize>) {
    with_loom(|loom| loom.set_default_stack_size(size));
}
