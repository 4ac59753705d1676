//! System primitives.
//!
//! This is where memory comes from: the page provider the region registry grows through.

use shim::{config, syscalls};

use crate::ptr::Pointer;

/// A source of fresh, page-aligned memory.
///
/// # Safety
///
/// A successful `request_pages(count)` must return a pointer aligned to `config::PAGE_SIZE`, valid
/// for reads and writes of `count * config::PAGE_SIZE` bytes, not aliased by any other live
/// allocation, and never reclaimed while the heap using the provider exists. The memory need not
/// be zeroed.
pub unsafe trait PageProvider {
    /// Obtain `count` contiguous pages.
    ///
    /// Returns `None` if the provider is exhausted. This is the only error channel for resource
    /// exhaustion.
    fn request_pages(&mut self, count: usize) -> Option<Pointer<u8>>;
}

/// Pages from anonymous private memory mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmap;

unsafe impl PageProvider for Mmap {
    fn request_pages(&mut self, count: usize) -> Option<Pointer<u8>> {
        log!(NOTE, "Mapping {} pages.", count);

        Pointer::from_raw(syscalls::map_pages(count))
    }
}

/// Pages from a fixed, caller supplied buffer.
///
/// This is meant for targets without an operating system, and for confining a heap to a known
/// chunk of memory. The buffer is handed out front to back, one request at a time, and never
/// reused.
pub struct StaticPages {
    /// The first page-aligned byte of the buffer.
    base: *mut u8,
    /// The number of bytes handed out so far.
    used: usize,
    /// The number of usable bytes after `base`.
    len: usize,
}

impl StaticPages {
    /// Create a provider handing out the pages of `mem`.
    ///
    /// Any unaligned head and any partial tail page of `mem` is left unused.
    pub fn new(mem: &'static mut [u8]) -> StaticPages {
        let start = mem.as_mut_ptr();
        let skip = (config::PAGE_SIZE - start as usize % config::PAGE_SIZE) % config::PAGE_SIZE;
        let len = mem.len().saturating_sub(skip);

        StaticPages {
            // Stay in bounds even when the buffer is smaller than the aligner.
            base: start.wrapping_add(skip),
            used: 0,
            len: len - len % config::PAGE_SIZE,
        }
    }

    /// The number of pages left.
    pub fn remaining_pages(&self) -> usize {
        (self.len - self.used) / config::PAGE_SIZE
    }
}

unsafe impl PageProvider for StaticPages {
    fn request_pages(&mut self, count: usize) -> Option<Pointer<u8>> {
        let bytes = count.checked_mul(config::PAGE_SIZE)?;
        if bytes == 0 || bytes > self.len - self.used {
            log!(
                WARNING,
                "Static pages exhausted ({} requested, {} left).",
                count,
                self.remaining_pages()
            );
            return None;
        }

        let res = unsafe {
            // In bounds, by the check above.
            Pointer::new(self.base.add(self.used))
        };
        self.used += bytes;

        Some(res)
    }
}

// The buffer is exclusively borrowed for `'static`.
unsafe impl Send for StaticPages {}

/// Cooperatively gives up a timeslice to the OS scheduler.
pub fn yield_now() {
    let res = syscalls::sched_yield();
    debug_assert!(res == 0, "Failed to yield the time slice.");
}
