//! The allocator.
//!
//! This is the placement policy on top of the ledger (first fit, splitting off the tail and
//! coalescing on release), the pinned `Heap` wrapping a locked ledger, and the global allocator
//! built from it.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::pin::Pin;
use core::ptr::{self, NonNull};

use shim::config;

use crate::chunk::{align_up, ChunkRef, Tag, ALIGN, HEADER_SIZE};
use crate::fail::{self, Error};
use crate::ledger::{Ledger, LedgerGuard};
use crate::sync::{HeapLock, Mutex, SpinLock};
use crate::sys::{Mmap, PageProvider};
use crate::validate::HeapStats;

/// The offset from the payload of `chunk` to the first address aligned to `align`, where `size`
/// bytes fit.
///
/// A nonzero offset must leave room for a free chunk in front.
fn aligned_gap(chunk: ChunkRef, size: usize, align: usize) -> Option<usize> {
    let payload = chunk.payload().as_ptr() as usize;
    let mut start = align_up(payload, align)?;

    if start != payload {
        let min = payload.checked_add(HEADER_SIZE + config::MIN_REMAINDER)?;
        if start < min {
            start = align_up(min, align)?;
        }
    }

    let gap = start - payload;
    if chunk.size() >= gap.checked_add(size)? {
        Some(gap)
    } else {
        None
    }
}

impl<P: PageProvider> Ledger<P> {
    /// Allocate a used chunk with a payload of at least `size` bytes, aligned to `align`.
    fn allocate(&self, size: usize, align: usize) -> Result<ChunkRef<'_>, Error> {
        assert!(align.is_power_of_two(), "Alignment {} is not a power of two.", align);

        let oom = Error::OutOfMemory { requested: size };
        let size = align_up(cmp::max(size, 1), ALIGN).ok_or(oom)?;

        let chunk = if align <= ALIGN {
            self.find_or_grow_free_chunk(size)?
        } else {
            let chunk = match self.first_fit(|chunk| aligned_gap(chunk, size, align).is_some())? {
                Some(chunk) => chunk,
                None => {
                    // Enough for any placement of the aligned payload.
                    let min = size
                        .checked_add(align)
                        .and_then(|n| n.checked_add(HEADER_SIZE + config::MIN_REMAINDER))
                        .ok_or(oom)?;
                    let tail = self.last_region()?;
                    self.grow_region(tail, min)?.first_chunk()
                }
            };

            match aligned_gap(chunk, size, align) {
                Some(0) => chunk,
                // Leave the front free.
                Some(gap) => self.split_chunk(chunk, gap - HEADER_SIZE)?,
                None => return Err(oom),
            }
        };

        self.claim_front(chunk, size)?;

        log!(DEBUG, "Allocated {:?} (align {}).", chunk, align);

        Ok(chunk)
    }

    /// Claim the first `size` bytes of a free chunk, splitting off the rest if it is large enough
    /// to be a chunk of its own.
    fn claim_front(&self, chunk: ChunkRef, size: usize) -> Result<(), Error> {
        debug_assert!(chunk.size() >= size, "Claiming past the end of {:?}.", chunk);

        if chunk.size() - size >= HEADER_SIZE + config::MIN_REMAINDER {
            self.split_chunk(chunk, size)?;
        }

        self.claim_chunk(chunk)
    }

    /// Give the tail of a used chunk back, keeping `size` bytes.
    fn shrink(&self, chunk: ChunkRef, size: usize) -> Result<(), Error> {
        if chunk.size() - size >= HEADER_SIZE + config::MIN_REMAINDER {
            let rest = self.split_chunk(chunk, size)?;
            let next = rest.next_or_broken()?;
            if next.tag()? == Tag::Free {
                self.merge_chunks(rest, next)?;
            }
        }

        Ok(())
    }

    /// Try to resize a used chunk without moving it.
    ///
    /// Shrinking always succeeds. Growing succeeds if the right neighbour is free and large
    /// enough. Returns whether the chunk was resized.
    fn resize_in_place(&self, chunk: ChunkRef, size: usize) -> Result<bool, Error> {
        chunk.expect(Tag::Used)?;

        let old = chunk.size();
        if size <= old {
            self.shrink(chunk, size)?;
            return Ok(true);
        }

        let next = chunk.next_or_broken()?;
        if next.tag()? == Tag::Free && old + HEADER_SIZE + next.size() >= size {
            self.merge_chunks(chunk, next)?;
            self.shrink(chunk, size)?;

            log!(INTERNAL, "Grew {:?} in place.", chunk);

            return Ok(true);
        }

        Ok(false)
    }

    /// Resize a used chunk, moving it if necessary.
    fn resize<'a>(
        &'a self,
        chunk: ChunkRef<'a>,
        size: usize,
        align: usize,
    ) -> Result<ChunkRef<'a>, Error> {
        let oom = Error::OutOfMemory { requested: size };
        let size = align_up(cmp::max(size, 1), ALIGN).ok_or(oom)?;

        if self.resize_in_place(chunk, size)? {
            return Ok(chunk);
        }

        let new = self.allocate(size, align)?;
        unsafe {
            // Both are live and distinct, and the new one is larger.
            ptr::copy_nonoverlapping(
                chunk.payload().as_ptr(),
                new.payload().as_ptr(),
                chunk.size(),
            );
        }
        self.release_chunk(chunk)?;

        log!(DEBUG, "Moved {:?} to {:?}.", chunk, new);

        Ok(new)
    }
}

/// A heap.
///
/// This is a ledger behind a lock, with an allocation policy. The ledger links to memory inside
/// the heap itself, so heaps are used pinned: either in a `static` (see `Pin::static_ref`) or
/// through `Box::pin`.
pub struct Heap<P, L: HeapLock = SpinLock> {
    /// The locked ledger.
    ledger: Mutex<Ledger<P>, L>,
}

impl<P, L: HeapLock> Heap<P, L> {
    /// Create an empty heap growing through `provider`.
    ///
    /// No memory is requested until the first allocation.
    pub const fn new(provider: P) -> Heap<P, L> {
        Heap {
            ledger: Mutex::new(Ledger::new(provider)),
        }
    }
}

impl<P: PageProvider, L: HeapLock> Heap<P, L> {
    /// Lock the heap.
    ///
    /// This gives access to the ledger primitives. Allocating through the heap while holding the
    /// guard deadlocks (or panics, for `NoLock`).
    pub fn lock(self: Pin<&Self>) -> LedgerGuard<'_, P, L> {
        LedgerGuard::new(self.get_ref().ledger.lock())
    }

    /// Run a policy operation on the locked ledger.
    ///
    /// A split remainder left next to a free chunk through the guard has to be settled first. The
    /// heap is validated afterwards in strict mode.
    fn with_ledger<T, F>(self: Pin<&Self>, op: F) -> Result<T, Error>
    where
        F: FnOnce(&Ledger<P>) -> Result<T, Error>,
    {
        let guard = self.lock();
        let ledger = guard.ledger();

        ledger.settled()?;
        let res = op(ledger)?;
        ledger.check()?;

        Ok(res)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(self: Pin<&Self>, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        self.with_ledger(|ledger| Ok(ledger.allocate(size, align)?.payload()))
    }

    /// Free an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap, and not freed since.
    pub unsafe fn release(self: Pin<&Self>, ptr: NonNull<u8>) -> Result<(), Error> {
        self.with_ledger(|ledger| {
            ledger.release_chunk(ChunkRef::from_payload(ptr))?;

            Ok(())
        })
    }

    /// Resize an allocation to `size` bytes, moving it if it cannot be resized in place.
    ///
    /// On error, the old allocation is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap, and not freed since. `align` must be the
    /// alignment it was allocated with.
    pub unsafe fn resize(
        self: Pin<&Self>,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, Error> {
        self.with_ledger(|ledger| {
            Ok(ledger.resize(ChunkRef::from_payload(ptr), size, align)?.payload())
        })
    }

    /// Resize an allocation to `size` bytes without moving it.
    ///
    /// Returns whether it succeeded.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap, and not freed since.
    pub unsafe fn resize_in_place(
        self: Pin<&Self>,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<bool, Error> {
        let oom = Error::OutOfMemory { requested: size };
        let size = align_up(cmp::max(size, 1), ALIGN).ok_or(oom)?;

        self.with_ledger(|ledger| ledger.resize_in_place(ChunkRef::from_payload(ptr), size))
    }

    /// The usable size of an allocation.
    ///
    /// This is at least the requested size.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap, and not freed since.
    pub unsafe fn usable_size(self: Pin<&Self>, ptr: NonNull<u8>) -> Result<usize, Error> {
        let _ledger = self.lock();
        let chunk = ChunkRef::from_payload(ptr);
        chunk.expect(Tag::Used)?;

        Ok(chunk.size())
    }

    /// Validate the whole heap.
    pub fn validate(self: Pin<&Self>) -> Result<HeapStats, Error> {
        self.lock().validate()
    }

    /// Turn strict validation on or off.
    pub fn set_strict(self: Pin<&Self>, strict: bool) {
        self.lock().set_strict(strict);
    }
}

/// The global heap.
static GLOBAL: Heap<Mmap> = Heap::new(Mmap);

/// The global heap, pinned.
#[inline]
fn global() -> Pin<&'static Heap<Mmap>> {
    Pin::static_ref(&GLOBAL)
}

/// Allocate a block of memory from the global heap.
///
/// Calls the OOM handler if the system is out of memory.
pub fn alloc(size: usize, align: usize) -> *mut u8 {
    match global().allocate(size, align) {
        Ok(ptr) => ptr.as_ptr(),
        Err(Error::OutOfMemory { .. }) => fail::oom(),
        Err(err) => fail::corrupted(err),
    }
}

/// Free a buffer allocated from the global heap.
///
/// Freeing null is a no-op.
///
/// # Safety
///
/// `ptr` must be null, or returned by `alloc` or `realloc` and not freed since.
pub unsafe fn free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        if let Err(err) = global().release(ptr) {
            fail::corrupted(err);
        }
    }
}

/// Reallocate a buffer of the global heap.
///
/// A null `ptr` allocates. Calls the OOM handler if the system is out of memory.
///
/// # Safety
///
/// `ptr` must be null, or returned by `alloc` or `realloc` with alignment `align`, and not freed
/// since.
pub unsafe fn realloc(ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
    let ptr = match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => return alloc(size, align),
    };

    match global().resize(ptr, size, align) {
        Ok(ptr) => ptr.as_ptr(),
        Err(Error::OutOfMemory { .. }) => fail::oom(),
        Err(err) => fail::corrupted(err),
    }
}

/// Try to reallocate a buffer of the global heap _inplace_.
///
/// This can be used to shrink (truncate) a buffer as well.
///
/// # Safety
///
/// `ptr` must have been returned by `alloc` or `realloc`, and not freed since.
pub unsafe fn realloc_inplace(ptr: *mut u8, size: usize) -> Result<(), ()> {
    let ptr = NonNull::new(ptr).ok_or(())?;

    match global().resize_in_place(ptr, size) {
        Ok(true) => Ok(()),
        Ok(false) | Err(Error::OutOfMemory { .. }) => Err(()),
        Err(err) => fail::corrupted(err),
    }
}

/// Validate the global heap.
///
/// This walks every region and chunk, so it is slow on a large heap.
pub fn validate() -> Result<HeapStats, Error> {
    global().validate()
}

/// The global allocator.
///
/// Install it with `#[global_allocator]`. It serves every request from a single heap of anonymous
/// memory mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match global().allocate(layout.size(), layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(Error::OutOfMemory { .. }) => ptr::null_mut(),
            Err(err) => fail::corrupted(err),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return ptr::null_mut(),
        };

        match global().resize(ptr, new_size, layout.align()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(Error::OutOfMemory { .. }) => ptr::null_mut(),
            Err(err) => fail::corrupted(err),
        }
    }
}
