use std::fmt::Display;

use thiserror::Error;

use crate::filemanager::BlockId;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a pin or lock request gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The bounded wait elapsed while the resource was still unavailable.
    TimedOut,
    /// The waiter was woken by an explicit interrupt.
    Interrupted,
    /// Wait-die: a younger transaction already holds the block.
    Died,
}

impl Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::TimedOut => write!(f, "timed out"),
            AbortCause::Interrupted => write!(f, "interrupted"),
            AbortCause::Died => write!(f, "died (wait-die)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// No buffer became available. The transaction must be rolled back.
    #[error("buffer abort: {0}")]
    BufferAbort(AbortCause),

    /// A lock could not be granted. The transaction must be rolled back.
    #[error("lock abort on {block}: {cause}")]
    LockAbort { block: BlockId, cause: AbortCause },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The value does not fit in the page at that offset. Nothing was written.
    #[error("{len} bytes do not fit at offset {offset} of a {capacity} byte page")]
    PageOverflow {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// A length prefix on the page is negative.
    #[error("corrupt page: negative length {len} at offset {offset}")]
    CorruptPage { offset: usize, len: i32 },

    #[error("corrupt log record: {0}")]
    CorruptLogRecord(String),

    #[error("block {0} is not pinned by this transaction")]
    BufferNotPinned(BlockId),
}

impl Error {
    /// True for the two abort kinds, which the caller handles by rolling back.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::BufferAbort(_) | Error::LockAbort { .. })
    }
}
