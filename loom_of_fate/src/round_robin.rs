//! # Round Robin
//!
//! The default policy: every admitted thread is offered in turn, with no
//! priorities and no favourites.
//!
//! ## Ordering
//! The rotation is a ring of thread ids. Its front is the next thread to be
//! offered, and the thread most recently offered (the running one) sits at
//! the back. `next` moves the front to the back and offers it.
//!
//! A newly admitted thread goes immediately before the running thread, so
//! it is offered after everything already waiting and before the running
//! thread comes around again: it never waits more than one rotation. When
//! no thread is known to be running it simply joins the back, which keeps
//! threads admitted before the Loom starts in creation order.

use std::collections::VecDeque;

use log::debug;

use super::scheduler::Scheduler;
use super::thread::ThreadId;

/// Round-robin scheduling over a ring of thread ids
#[derive(Debug, Default)]
pub struct RoundRobin {
    ring: VecDeque<ThreadId>,
    /// The thread most recently returned by `next`, while it is still admitted
    running: Option<ThreadId>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The admitted threads in the order they will be offered
    pub fn rotation(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ring.iter().copied()
    }

    fn position(&self, thread: ThreadId) -> Option<usize> {
        self.ring.iter().position(|&id| id == thread)
    }
}

impl Scheduler for RoundRobin {
    fn init(&mut self) {
        debug!("round robin: initialized");
        self.ring.clear();
        self.running = None;
    }

    fn shutdown(&mut self) {
        debug!("round robin: shut down with {} thread(s) admitted", self.ring.len());
        self.ring.clear();
        self.running = None;
    }

    fn admit(&mut self, thread: ThreadId) {
        if self.position(thread).is_some() {
            return;
        }

        match self.running.and_then(|running| self.position(running)) {
            Some(index) => self.ring.insert(index, thread),
            None => self.ring.push_back(thread),
        }
        debug!("round robin: admitted thread {}", thread);
    }

    fn remove(&mut self, thread: ThreadId) {
        let Some(index) = self.position(thread) else {
            return;
        };

        self.ring.remove(index);
        if self.running == Some(thread) {
            self.running = None;
        }
        debug!("round robin: removed thread {}", thread);
    }

    fn next(&mut self) -> Option<ThreadId> {
        let candidate = *self.ring.front()?;

        // Only the running thread is left; there is nowhere to go.
        if Some(candidate) == self.running {
            return None;
        }

        self.ring.rotate_left(1);
        self.running = Some(candidate);
        Some(candidate)
    }

    fn queue_length(&self) -> usize {
        self.ring.len()
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
