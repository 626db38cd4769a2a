//! The Loom - registry of every thread and keeper of the active scheduler

use std::collections::BTreeMap;
use std::ptr::{addr_of, addr_of_mut};

use log::{debug, info, trace, warn};

use super::context::ThreadContext;
use super::error::{LwpError, Result};
use super::round_robin::RoundRobin;
use super::scheduler::{LoomStats, Scheduler};
use super::stack::Stack;
use super::thread::{Thread, ThreadId, ThreadInfo, FIRST_CREATED_THREAD, ORIGINAL_THREAD};

/// The body a created thread runs; its return value is the exit status
pub(crate) type ThreadBody = Box<dyn FnOnce() -> i32 + 'static>;

/// What the exiting thread should do once its status is recorded
pub(crate) enum Termination {
    /// There is no running Loom on this host thread
    Detached,
    /// Nothing is left to schedule
    LastThread,
    /// Switch away and never come back
    Continue,
}

/// Outcome of one pass over the registry
pub(crate) enum Reap {
    Reaped(Box<Thread>),
    /// Nothing terminated and nothing else could terminate
    Quiescent,
    /// Other threads are still running; yield and look again
    Pending,
}

/// The per-host-thread state behind the public API
///
/// Threads are boxed so their contexts keep a fixed address while a switch
/// is in flight, whatever happens to the map around them.
pub(crate) struct Loom {
    threads: BTreeMap<ThreadId, Box<Thread>>,
    scheduler: Option<Box<dyn Scheduler>>,
    current_thread: Option<ThreadId>,
    next_thread_id: u64,
    /// Per-host-thread override of the rlimit-derived default
    default_stack_size: Option<usize>,
    context_switches: u64,
}

impl Loom {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            scheduler: None,
            current_thread: None,
            next_thread_id: FIRST_CREATED_THREAD,
            default_stack_size: None,
            context_switches: 0,
        }
    }

    /// The active scheduler, installing round robin if there is none yet
    pub fn scheduler(&mut self) -> &mut dyn Scheduler {
        let scheduler = self.scheduler.get_or_insert_with(|| {
            let mut default: Box<dyn Scheduler> = Box::new(RoundRobin::new());
            default.init();
            default
        });
        &mut **scheduler
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub fn set_default_stack_size(&mut self, size: Option<usize>) {
        self.default_stack_size = size;
    }

    /// Wrap the calling execution as the original thread
    pub fn adopt_original(&mut self) -> Result<()> {
        if self.current_thread.is_some() {
            return Err(LwpError::AlreadyStarted);
        }

        self.threads.insert(ORIGINAL_THREAD, Box::new(Thread::original()));
        self.scheduler().admit(ORIGINAL_THREAD);
        self.current_thread = Some(ORIGINAL_THREAD);
        info!("original thread adopted as {}", ORIGINAL_THREAD);
        Ok(())
    }

    /// Spawn a new thread
    ///
    /// Nothing is touched until the stack is mapped, so a failure leaves the
    /// Loom exactly as it was and consumes no id.
    pub fn spawn(&mut self, body: ThreadBody, stack_size: Option<usize>) -> Result<ThreadId> {
        let mut stack = Stack::acquire(stack_size.or(self.default_stack_size))?;

        let thread_id = ThreadId(self.next_thread_id);
        self.next_thread_id += 1;

        // Ownership of the body passes to the new thread, which reclaims it
        // in `thread_entry` on its first run.
        let payload = Box::into_raw(Box::new(body)) as usize;
        let context = ThreadContext::bootstrap(&mut stack, crate::thread_entry, payload);
        debug!(
            "spawned thread {} with a {}-byte stack, rsp={:#x}",
            thread_id,
            stack.size(),
            context.rsp
        );

        self.threads.insert(thread_id, Box::new(Thread::new(thread_id, context, stack)));
        self.scheduler().admit(thread_id);

        Ok(thread_id)
    }

    /// Prepare for yielding: select the next thread and get context pointers
    ///
    /// Returns `None` when the caller should simply keep running. Otherwise
    /// the current-thread reference already names the target, and the caller
    /// must release the Loom before switching through the pointers.
    pub fn prepare_yield(&mut self) -> Option<(*mut ThreadContext, *const ThreadContext)> {
        let current_id = self.current_thread?;
        let next_id = self.scheduler().next()?;

        if next_id == current_id {
            return None;
        }

        match self.threads.get(&next_id) {
            Some(next) if !next.status().is_terminated() => {}
            Some(_) => {
                warn!("scheduler offered terminated thread {}; staying on {}", next_id, current_id);
                return None;
            }
            None => {
                warn!("scheduler offered unknown thread {}; staying on {}", next_id, current_id);
                return None;
            }
        }

        let from = {
            let current = self.threads.get_mut(&current_id)?;
            current.record_yield();
            addr_of_mut!(current.context)
        };
        let to = addr_of!(self.threads.get(&next_id)?.context);

        self.current_thread = Some(next_id);
        self.context_switches += 1;
        trace!("switching {} -> {}", current_id, next_id);

        Some((from, to))
    }

    /// Record the current thread's exit status and take it off the schedule
    ///
    /// The thread stays in the registry, stack and all: it is still running
    /// on that stack until it switches away.
    pub fn terminate_current(&mut self, status: i32) -> Termination {
        let Some(current_id) = self.current_thread else {
            return Termination::Detached;
        };

        if let Some(current) = self.threads.get_mut(&current_id) {
            current.terminate(status);
            debug!("thread {} exiting with {:?}", current_id, current.status());
        }

        let scheduler = self.scheduler();
        scheduler.remove(current_id);
        if scheduler.queue_length() == 0 {
            Termination::LastThread
        } else {
            Termination::Continue
        }
    }

    /// Unlink the oldest terminated thread, if any
    pub fn reap_one(&mut self) -> Reap {
        if self.current_thread.is_none() {
            return Reap::Quiescent;
        }

        let terminated = self
            .threads
            .values()
            .find(|thread| !thread.is_original() && thread.status().is_terminated())
            .map(|thread| thread.id());

        if let Some(thread) = terminated.and_then(|id| self.threads.remove(&id)) {
            debug!("reaped thread {} ({:?})", thread.id(), thread.status());
            return Reap::Reaped(thread);
        }

        if self.scheduler().queue_length() <= 1 {
            Reap::Quiescent
        } else {
            Reap::Pending
        }
    }

    /// Install `incoming`, carrying every live thread over to it
    pub fn replace_scheduler(&mut self, mut incoming: Box<dyn Scheduler>) {
        incoming.init();

        // The running thread goes in last so that the first `next()` offers
        // someone else.
        let running = self.current_thread;
        for thread in self
            .threads
            .values()
            .filter(|thread| !thread.status().is_terminated() && Some(thread.id()) != running)
        {
            incoming.admit(thread.id());
        }
        if let Some(running) = running.filter(|id| self.threads.contains_key(id)) {
            incoming.admit(running);
        }

        let name = incoming.name();
        let admitted = incoming.queue_length();
        if let Some(mut outgoing) = self.scheduler.replace(incoming) {
            outgoing.shutdown();
            info!(
                "scheduler {} replaced by {} ({} thread(s) migrated)",
                outgoing.name(),
                name,
                admitted
            );
        } else {
            info!("scheduler {} installed ({} thread(s) admitted)", name, admitted);
        }
    }

    pub fn thread_info(&self, thread_id: ThreadId) -> Option<ThreadInfo> {
        self.threads.get(&thread_id).map(|thread| thread.info())
    }

    /// Get Loom statistics
    pub fn stats(&mut self) -> LoomStats {
        let terminated_threads = self
            .threads
            .values()
            .filter(|thread| thread.status().is_terminated())
            .count();
        let total_threads = self.threads.len();
        let context_switches = self.context_switches;
        let scheduler = self.scheduler();

        LoomStats {
            total_threads,
            live_threads: total_threads - terminated_threads,
            terminated_threads,
            queue_length: scheduler.queue_length(),
            context_switches,
            scheduler: scheduler.name(),
        }
    }
}

impl Drop for Loom {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.shutdown();
        }
        if !self.threads.is_empty() {
            debug!("releasing {} unreaped thread(s)", self.threads.len());
        }
    }
}
