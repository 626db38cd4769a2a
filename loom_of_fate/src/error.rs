//! Errors raised by the Loom

use std::io;

use thiserror::Error;

use crate::thread::ThreadId;

/// Everything that can go wrong while weaving threads.
///
/// There is no retry policy anywhere in the Loom: a failure is reported to
/// the caller, who decides what to do next.
#[derive(Debug, Error)]
pub enum LwpError {
    /// The host refused to map a stack of the requested size.
    #[error("unable to map a {size}-byte thread stack")]
    ResourceExhausted {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// No thread with this id is known to the registry.
    #[error("no such thread: {0}")]
    InvalidThread(ThreadId),

    /// `start` has already adopted the original thread.
    #[error("the loom has already been started on this thread")]
    AlreadyStarted,
}

pub type Result<T> = core::result::Result<T, LwpError>;
