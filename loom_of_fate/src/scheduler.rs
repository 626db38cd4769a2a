//! The Scheduler - who weaves next
//!
//! The Loom itself never decides ordering. It hands every decision to the
//! active [`Scheduler`], which sees nothing but thread ids: the threads
//! themselves stay in the Loom's registry, so a policy can never be left
//! holding a dangling thread.

use super::thread::ThreadId;

/// A replaceable scheduling policy
///
/// A policy maintains an ordering over the threads admitted to it. The Loom
/// keeps every live thread admitted, the running one included, and removes a
/// thread only when it exits.
pub trait Scheduler {
    /// Called once when the policy becomes active
    fn init(&mut self) {}

    /// Called once when the policy is replaced or the Loom is torn down
    fn shutdown(&mut self) {}

    /// Add `thread` to the ordering
    fn admit(&mut self, thread: ThreadId);

    /// Drop `thread` from the ordering. Removing an absent thread is a no-op.
    fn remove(&mut self, thread: ThreadId);

    /// The thread to run next
    ///
    /// Returns `None` when there is nothing useful to switch to: no thread
    /// is admitted, or only the running one is.
    fn next(&mut self) -> Option<ThreadId>;

    /// Number of admitted threads
    fn queue_length(&self) -> usize;

    /// A name for diagnostics
    fn name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

/// Statistics about the Loom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoomStats {
    /// Threads in the registry, reaped ones excluded
    pub total_threads: usize,
    pub live_threads: usize,
    /// Threads that exited and wait to be reaped
    pub terminated_threads: usize,
    /// What the active policy reports as admitted
    pub queue_length: usize,
    pub context_switches: u64,
    pub scheduler: &'static str,
}
