//! Thread definitions - The Threads of Fate

use core::fmt;

use bitflags::bitflags;
use x86_64::VirtAddr;

use super::context::ThreadContext;
use super::stack::Stack;

/// A unique identifier for a thread
///
/// Ids are handed out in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// The "no thread" sentinel, for callers that cannot use `Option`
pub const NO_THREAD: ThreadId = ThreadId(0);

/// The id reserved for the thread that called [`start`](crate::start)
pub const ORIGINAL_THREAD: ThreadId = ThreadId(1);

/// The first id handed to a created thread
pub(crate) const FIRST_CREATED_THREAD: u64 = 2;

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Flag bits of a packed thread status word
    ///
    /// The low byte of the word is the exit code, the flags sit above it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const TERMINATED = 1 << 8;
    }
}

const EXIT_CODE_MASK: u32 = 0xFF;

/// The state of a thread in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// The thread can still be scheduled
    Live,

    /// The thread has exited and waits to be reaped
    Terminated(u8),
}

impl ThreadStatus {
    /// Terminated status for an exit code, truncated to one byte
    pub fn terminated(code: i32) -> Self {
        ThreadStatus::Terminated((code as u32 & EXIT_CODE_MASK) as u8)
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, ThreadStatus::Terminated(_))
    }

    pub fn exit_code(self) -> Option<u8> {
        match self {
            ThreadStatus::Live => None,
            ThreadStatus::Terminated(code) => Some(code),
        }
    }

    /// Pack into a single word: [`StatusFlags::TERMINATED`] plus the exit code
    pub fn to_raw(self) -> u32 {
        match self {
            ThreadStatus::Live => StatusFlags::empty().bits(),
            ThreadStatus::Terminated(code) => StatusFlags::TERMINATED.bits() | u32::from(code),
        }
    }

    /// Decode a word produced by [`ThreadStatus::to_raw`]
    pub fn from_raw(raw: u32) -> Self {
        if StatusFlags::from_bits_truncate(raw).contains(StatusFlags::TERMINATED) {
            ThreadStatus::Terminated((raw & EXIT_CODE_MASK) as u8)
        } else {
            ThreadStatus::Live
        }
    }
}

/// A thread of fate in the Loom
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) status: ThreadStatus,

    // CPU state (for context switching)
    pub(crate) context: ThreadContext,

    /// `None` for the original thread, which keeps running on the host stack
    pub(crate) stack: Option<Stack>,

    pub(crate) yields: u64,
}

impl Thread {
    /// Create a new thread that will begin in `context` on `stack`
    pub fn new(id: ThreadId, context: ThreadContext, stack: Stack) -> Self {
        Self {
            id,
            status: ThreadStatus::Live,
            context,
            stack: Some(stack),
            yields: 0,
        }
    }

    /// Wrap the execution that entered the Loom
    ///
    /// Its context is empty until the first switch away from it fills it in.
    pub fn original() -> Self {
        Self {
            id: ORIGINAL_THREAD,
            status: ThreadStatus::Live,
            context: ThreadContext::empty(),
            stack: None,
            yields: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn is_original(&self) -> bool {
        self.stack.is_none()
    }

    /// Byte length of the owned stack (0 for the original thread)
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Record that this thread yielded
    pub fn record_yield(&mut self) {
        self.yields += 1;
    }

    /// Mark the thread terminated with `code & 0xFF`
    pub fn terminate(&mut self, code: i32) {
        self.status = ThreadStatus::terminated(code);
    }

    pub fn info(&self) -> ThreadInfo {
        let (stack_bottom, stack_top) = match &self.stack {
            Some(stack) => (Some(stack.bottom()), Some(stack.top())),
            None => (None, None),
        };

        ThreadInfo {
            id: self.id,
            status: self.status,
            stack_bottom,
            stack_top,
            stack_size: self.stack_size(),
            yields: self.yields,
            is_original: self.is_original(),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("yields", &self.yields)
            .finish_non_exhaustive()
    }
}

/// A snapshot of one thread, safe to hand to application code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub stack_bottom: Option<VirtAddr>,
    pub stack_top: Option<VirtAddr>,
    pub stack_size: usize,
    pub yields: u64,
    pub is_original: bool,
}
