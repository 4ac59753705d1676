//! Configuration.
//!
//! This module contains anything which can be tweaked and customized to the users preferences.

use core::mem;

use crate::syscalls;

/// The granularity of the page provider, in bytes.
///
/// Every region is a multiple of this, and starts on a boundary of it.
pub const PAGE_SIZE: usize = 4096;

/// The minimum number of pages a region spans.
///
/// Small requests still map this much, so that a handful of allocations do not each cost a
/// system call.
pub const MIN_REGION_PAGES: usize = 4;

/// The smallest payload a free remainder of a split may have.
///
/// Splitting is refused (or skipped, by the policy layer) if the leftover would be smaller than a
/// header plus this many bytes.
pub const MIN_REMAINDER: usize = mem::size_of::<usize>();

/// The file descriptor diagnostics are written to.
pub const LOG_TARGET: i32 = 2;

/// The default OOM handler.
#[cold]
pub fn default_oom_handler() -> ! {
    // Log some message.
    syscalls::log("\x1b[31;1mThe application ran out of memory. Aborting.\x1b[m\n");

    syscalls::abort();
}
