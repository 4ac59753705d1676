//! **chunkalloc:** A region and chunk allocator core.
//!
//! Memory is obtained from a page provider in regions of whole pages. Each region is carved into
//! an address-ordered chain of chunks, every one of them prefixed with a tagged header. The chunk
//! ledger splits and merges chunks, and the policy layer on top hands them out first-fit.
//!
//! Use `Allocator` as the global allocator, or pin a `Heap` over any `PageProvider` of your own.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate chunkalloc_shim as shim;

#[macro_use]
mod log;

mod allocator;
mod chunk;
mod ledger;
mod ptr;
mod region;
mod sync;
mod sys;
mod validate;
mod write;
pub mod fail;

pub use allocator::{alloc, free, realloc, realloc_inplace, validate, Allocator, Heap};
pub use chunk::{align_up, ChunkRef, Tag, ALIGN, HEADER_SIZE};
pub use fail::{set_oom_handler, Error, Fault};
pub use ledger::{Ledger, LedgerGuard};
pub use ptr::Pointer;
pub use region::{region_size, Chunks, Region, Regions};
pub use shim::config;
pub use sync::{HeapLock, NoLock, SpinLock};
pub use sys::{Mmap, PageProvider, StaticPages};
pub use validate::HeapStats;
