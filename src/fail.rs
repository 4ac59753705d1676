//! General error handling.

use core::fmt::Write;

use shim::{config, syscalls};
use thiserror::Error;

use crate::chunk::Tag;
use crate::sync::Mutex;
use crate::write::LogWriter;

/// What exactly was found broken in a corrupted heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    /// The magic word of a header is none of the valid tags.
    #[error("invalid tag word 0x{0:x}")]
    BadTag(usize),
    /// The tag is valid, but not one the operation accepts here.
    #[error("unexpected {0:?} chunk")]
    UnexpectedTag(Tag),
    /// The header is not aligned to the pointer size.
    #[error("misaligned header")]
    Misaligned,
    /// The chunk does not start where the previous one ended.
    #[error("gap or overlap, chunk expected at 0x{expected:x}")]
    Gap {
        /// Where the chunk should have been.
        expected: usize,
    },
    /// A `prev` or `next` link disagrees with its counterpart, or is missing.
    #[error("broken chunk link")]
    BrokenLink,
    /// Two address-adjacent chunks are both free.
    #[error("adjacent free chunks")]
    AdjacentFree,
    /// A sentinel with a non-zero size.
    #[error("sentinel of size {0}")]
    SentinelSize(usize),
    /// A region which is not a whole number of pages.
    #[error("region of {0} bytes")]
    RegionSize(usize),
    /// A chunk extends past the end of its region.
    #[error("chunk overruns its region")]
    Overrun,
}

/// An allocator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The page provider is exhausted, or the request is too large to size a region for.
    ///
    /// This is never retried internally.
    #[error("out of memory while reserving {requested} bytes")]
    OutOfMemory {
        /// The payload size that could not be satisfied.
        requested: usize,
    },
    /// The heap structure is inconsistent.
    ///
    /// This is unrecoverable. Carrying on risks damaging the heap further.
    #[error("heap corruption at 0x{addr:x}: {fault}")]
    Corruption {
        /// The address of the offending header.
        addr: usize,
        /// What is wrong with it.
        fault: Fault,
    },
}

impl Error {
    /// Construct a corruption error.
    #[inline]
    pub fn corruption(addr: usize, fault: Fault) -> Error {
        Error::Corruption { addr, fault }
    }

    /// Is this a corruption (rather than an out-of-memory) error?
    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}

/// The current OOM handler.
static OOM_HANDLER: Mutex<fn() -> !> = Mutex::new(config::default_oom_handler as fn() -> !);

/// Call the OOM handler.
///
/// This is used one out-of-memory errors, and will never return. Usually, it simply consists
/// of aborting the process.
///
/// # An important note
///
/// This is for OOM-conditions, not malformed or too big allocations, but when the system is unable
/// to gather memory for the allocation (the page provider fails).
pub fn oom() -> ! {
    let handler = *OOM_HANDLER.lock();
    handler()
}

/// Set the OOM handler.
///
/// This is called when the process is out-of-memory.
#[inline]
pub fn set_oom_handler(handler: fn() -> !) {
    *OOM_HANDLER.lock() = handler;
}

/// Report heap corruption and abort.
///
/// The message is written without allocating, since the heap can no longer be trusted.
#[cold]
pub fn corrupted(err: Error) -> ! {
    log!(ERROR, "{}", err);

    let _ = writeln!(LogWriter::new(), "\x1b[31;1m{}. Aborting.\x1b[m", err);

    syscalls::abort()
}
