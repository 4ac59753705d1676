//! The chunk ledger.
//!
//! The ledger owns the region registry and the chunk chains inside every region. It provides the
//! primitives a placement policy is built from: finding (or growing) a free chunk, splitting,
//! merging, claiming and releasing.

use core::cell::{Cell, Ref, RefCell, UnsafeCell};
use core::marker::PhantomPinned;
use core::{cmp, ops};

use shim::config;

use crate::chunk::{align_up, Chunk, ChunkRef, Tag, ALIGN, HEADER_SIZE};
use crate::fail::{Error, Fault};
use crate::ptr::Pointer;
use crate::region::{Region, Regions};
use crate::sync::{HeapLock, MutexGuard};
use crate::sys::PageProvider;

/// The heap state.
///
/// Guarantees
/// ==========
///
/// After every public mutation:
///
/// 1. Every chunk carries one of the four valid tags.
/// 2. The chunks of a region are contiguous, in address order, from the header to the sentinel.
/// 3. No two adjacent chunks are both free, except the loose remainder of the last split.
/// 4. Region headers and sentinels are only written when a region is created.
/// 5. Every header is pointer aligned, and every region (but the head) is a page multiple.
///
/// With strict mode on, all of this is verified by a full walk before and after each public
/// mutation.
///
/// Every operation takes `&self`: the ledger is only reachable through its lock, and chunk
/// handles borrow the ledger, so they cannot be kept past the lock guard.
pub struct Ledger<P> {
    /// The head region.
    ///
    /// This is a header immediately followed by a sentinel, with no capacity in between. It keeps
    /// the registry non-empty, and is linked to by the first real region, so the ledger must not
    /// move once a region has been added.
    head: UnsafeCell<[Chunk; 2]>,
    /// Where regions come from.
    provider: RefCell<P>,
    /// Validate the whole heap around each mutation?
    strict: Cell<bool>,
    /// The free remainder of the last split, while it may still sit next to another free chunk.
    ///
    /// Only tracked in strict mode. Validation lets this one pair of free neighbours through.
    loose: Cell<Option<Pointer<Chunk>>>,
    _pin: PhantomPinned,
}

// The chunk memory is only ever reached through the ledger.
unsafe impl<P: Send> Send for Ledger<P> {}

impl<P> Ledger<P> {
    /// Create a ledger with only the head region.
    ///
    /// This makes no requests to the provider. Strict mode starts on in debug builds and with the
    /// `strict` feature.
    pub const fn new(provider: P) -> Ledger<P> {
        Ledger {
            head: UnsafeCell::new([
                Chunk::new(Tag::RegionHeader, 2 * HEADER_SIZE),
                Chunk::new(Tag::RegionSentinel, 0),
            ]),
            provider: RefCell::new(provider),
            strict: Cell::new(cfg!(any(debug_assertions, feature = "strict"))),
            loose: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// The head region.
    #[inline]
    pub fn head(&self) -> Region<'_> {
        unsafe {
            // The array is a header directly followed by a sentinel.
            Region::from_header(ChunkRef::from_ptr(Pointer::new(self.head.get() as *mut Chunk)))
        }
    }

    /// Iterate over all regions, head region first.
    #[inline]
    pub fn regions(&self) -> Regions<'_> {
        Regions::new(self.head())
    }

    /// Is strict validation on?
    #[inline]
    pub fn is_strict(&self) -> bool {
        self.strict.get()
    }

    /// The page provider.
    ///
    /// The heap cannot grow while this is borrowed.
    #[inline]
    pub fn provider(&self) -> Ref<'_, P> {
        self.provider.borrow()
    }

    /// The free remainder of the last split, if it may still sit next to another free chunk.
    ///
    /// This is always `None` outside strict mode.
    #[inline]
    pub fn loose(&self) -> Option<ChunkRef<'_>> {
        self.loose.get().map(|ptr| unsafe {
            // Set from a live chunk, and cleared as soon as it is merged away.
            ChunkRef::from_ptr(ptr)
        })
    }

    /// Turn strict validation on or off.
    pub(crate) fn set_strict(&self, strict: bool) {
        self.strict.set(strict);
        self.loose.set(None);
    }

    /// Mark `chunk` as the loose remainder, in strict mode.
    #[inline]
    pub(crate) fn loosen(&self, chunk: ChunkRef) {
        if self.is_strict() {
            self.loose.set(Some(chunk.as_ptr()));
        }
    }

    /// Forget the loose remainder once it no longer has a free neighbour.
    pub(crate) fn settle(&self) {
        if let Some(chunk) = self.loose() {
            let paired = chunk.is_free()
                && (chunk.prev().map_or(false, ChunkRef::is_free)
                    || chunk.next().map_or(false, ChunkRef::is_free));

            if !paired {
                self.loose.set(None);
            }
        }
    }

    /// Fail if a split remainder still sits next to another free chunk.
    #[inline]
    pub(crate) fn settled(&self) -> Result<(), Error> {
        match self.loose() {
            Some(chunk) => Err(Error::corruption(chunk.addr(), Fault::AdjacentFree)),
            None => Ok(()),
        }
    }

    /// Validate the heap, if in strict mode.
    #[inline]
    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_strict() {
            self.validate().map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl<P: PageProvider> Ledger<P> {
    /// Ask the provider for `count` pages.
    #[inline]
    pub(crate) fn request_pages(&self, count: usize) -> Option<Pointer<u8>> {
        self.provider.borrow_mut().request_pages(count)
    }

    /// Find the first free chunk in the heap satisfying `fits`.
    pub(crate) fn first_fit<F>(&self, mut fits: F) -> Result<Option<ChunkRef<'_>>, Error>
    where
        F: FnMut(ChunkRef) -> bool,
    {
        for region in self.regions() {
            for chunk in region?.chunks() {
                let chunk = chunk?;
                if chunk.is_free() && fits(chunk) {
                    return Ok(Some(chunk));
                }
            }
        }

        Ok(None)
    }

    /// Find a free chunk of at least `min_size` bytes, growing the heap if there is none.
    ///
    /// The size is rounded up to the alignment. The chunk is neither split nor claimed.
    pub(crate) fn find_or_grow_free_chunk(&self, min_size: usize) -> Result<ChunkRef<'_>, Error> {
        let size = align_up(cmp::max(min_size, 1), ALIGN).ok_or(Error::OutOfMemory {
            requested: min_size,
        })?;

        if let Some(chunk) = self.first_fit(|chunk| chunk.size() >= size)? {
            log!(INTERNAL, "Found {:?} for {} bytes.", chunk, size);
            return Ok(chunk);
        }

        let tail = self.last_region()?;
        Ok(self.grow_region(tail, size)?.first_chunk())
    }

    /// Split a chunk, keeping `keep` bytes in place.
    ///
    /// The tail becomes a new free chunk, which is returned. It is not merged with its right
    /// neighbour.
    ///
    /// # Panics
    ///
    /// Panics if `keep` is unaligned, or the chunk is too small to leave a remainder of at least
    /// `config::MIN_REMAINDER` bytes after the new header.
    pub(crate) fn split_chunk<'a>(
        &'a self,
        chunk: ChunkRef<'a>,
        keep: usize,
    ) -> Result<ChunkRef<'a>, Error> {
        let tag = chunk.tag()?;
        if tag != Tag::Free && tag != Tag::Used {
            return Err(Error::corruption(chunk.addr(), Fault::UnexpectedTag(tag)));
        }

        let size = chunk.size();
        assert!(keep % ALIGN == 0, "Split point {} is unaligned.", keep);
        assert!(
            keep.checked_add(HEADER_SIZE + config::MIN_REMAINDER)
                .map_or(false, |min| size >= min),
            "Split {} out of bound (size is {})!",
            keep,
            size
        );

        let next = chunk.next_or_broken()?;
        next.tag()?;

        let rest = unsafe {
            // In bounds, by the assertion above.
            ChunkRef::write(
                chunk.as_ptr().cast::<u8>().byte_add(HEADER_SIZE + keep),
                Tag::Free,
                size - keep - HEADER_SIZE,
                Some(chunk),
                Some(next),
            )
        };
        chunk.set_size(keep);
        chunk.set_next(Some(rest));
        next.set_prev(Some(rest));

        log!(INTERNAL, "Split {:?} off {:?}.", rest, chunk);

        Ok(rest)
    }

    /// Merge `second` into `first`, its left neighbour.
    ///
    /// Merging into a sentinel is a no-op. After a merge, the header of `second` is dead.
    ///
    /// # Panics
    ///
    /// Panics if `second` is not the next chunk of `first`.
    pub(crate) fn merge_chunks<'a>(
        &'a self,
        first: ChunkRef<'a>,
        second: ChunkRef<'a>,
    ) -> Result<ChunkRef<'a>, Error> {
        let first_tag = first.tag()?;
        let second_tag = second.tag()?;

        assert!(
            first.next() == Some(second),
            "Merging non-adjacent chunks {:?} and {:?}.",
            first,
            second
        );

        // Sentinels are never merged away.
        if second_tag == Tag::RegionSentinel {
            return Ok(first);
        }

        for &(chunk, tag) in &[(first, first_tag), (second, second_tag)] {
            if tag != Tag::Free && tag != Tag::Used {
                return Err(Error::corruption(chunk.addr(), Fault::UnexpectedTag(tag)));
            }
        }

        if second.prev() != Some(first) || first.end() != second.addr() {
            return Err(Error::corruption(second.addr(), Fault::BrokenLink));
        }

        let after = second.next_or_broken()?;
        after.tag()?;

        first.set_size(first.size() + HEADER_SIZE + second.size());
        first.set_next(Some(after));
        after.set_prev(Some(first));

        if self.is_strict() {
            second.kill();
        }

        log!(INTERNAL, "Merged into {:?}.", first);

        Ok(first)
    }

    /// Mark a free chunk used.
    pub(crate) fn claim_chunk(&self, chunk: ChunkRef) -> Result<(), Error> {
        chunk.expect(Tag::Free)?;
        chunk.set_tag(Tag::Used);

        Ok(())
    }

    /// Release a used chunk.
    ///
    /// The chunk is marked free, then merged with its right neighbour if that is free, and then
    /// into its left neighbour if that is free. The resulting chunk (the leftmost of the three) is
    /// returned.
    pub(crate) fn release_chunk<'a>(&'a self, chunk: ChunkRef<'a>) -> Result<ChunkRef<'a>, Error> {
        chunk.expect(Tag::Used)?;

        // Read everything before writing anything.
        let next = chunk.next_or_broken()?;
        let next_free = next.tag()? == Tag::Free;
        let prev = match chunk.prev() {
            Some(prev) if prev.tag()? == Tag::Free => Some(prev),
            _ => None,
        };

        chunk.set_tag(Tag::Free);

        let mut res = chunk;
        if next_free {
            res = self.merge_chunks(res, next)?;
        }
        if let Some(prev) = prev {
            res = self.merge_chunks(prev, res)?;
        }

        log!(DEBUG, "Released into {:?}.", res);

        Ok(res)
    }
}

/// Exclusive access to a locked ledger.
///
/// Reads go through `Deref`. Handles obtained through the guard borrow it, so they are dropped
/// before the lock is released. In strict mode, every mutation validates the heap before writing
/// anything, and again afterwards, so it either completes or leaves the heap as it was.
pub struct LedgerGuard<'a, P, L: HeapLock> {
    /// The inner lock.
    inner: MutexGuard<'a, Ledger<P>, L>,
}

impl<'a, P, L: HeapLock> ops::Deref for LedgerGuard<'a, P, L> {
    type Target = Ledger<P>;

    #[inline]
    fn deref(&self) -> &Ledger<P> {
        &self.inner
    }
}

impl<'a, P: PageProvider, L: HeapLock> LedgerGuard<'a, P, L> {
    /// Wrap a held lock.
    #[inline]
    pub(crate) fn new(inner: MutexGuard<'a, Ledger<P>, L>) -> LedgerGuard<'a, P, L> {
        LedgerGuard { inner }
    }

    /// The ledger, bypassing the checked operations of the guard.
    #[inline]
    pub(crate) fn ledger(&self) -> &Ledger<P> {
        &self.inner
    }

    /// Turn strict validation on or off.
    pub fn set_strict(&self, strict: bool) {
        self.inner.set_strict(strict);
    }

    /// Run a mutation, with strict-mode validation on both sides.
    fn mutate<'g, T, F>(&'g self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&'g Ledger<P>) -> Result<T, Error>,
    {
        let ledger: &'g Ledger<P> = &self.inner;

        ledger.check()?;
        let res = op(ledger)?;
        ledger.settle();
        ledger.check()?;

        Ok(res)
    }

    /// Make sure `chunk` lies in a region of this heap.
    ///
    /// # Panics
    ///
    /// Panics if it does not.
    fn adopt(&self, chunk: ChunkRef) -> Result<(), Error> {
        assert!(
            self.inner.region_of(chunk.addr())?.is_some(),
            "Chunk 0x{:x} is not part of this heap.",
            chunk.addr()
        );

        Ok(())
    }

    /// Obtain a fresh region from the page provider and link it in after `after`.
    ///
    /// The region is `max(4 pages, page_align(min_payload + 3 * HEADER_SIZE))` bytes and holds one
    /// free chunk of at least `min_payload` bytes. A failing provider leaves the heap untouched and
    /// yields `Error::OutOfMemory`.
    ///
    /// # Panics
    ///
    /// Panics if `after` is not a region of this heap.
    pub fn grow_region<'g>(
        &'g self,
        after: Region<'g>,
        min_payload: usize,
    ) -> Result<Region<'g>, Error> {
        let mut known = false;
        for region in self.inner.regions() {
            known |= region? == after;
        }
        assert!(known, "Region 0x{:x} is not part of this heap.", after.addr());

        self.mutate(|ledger| ledger.grow_region(after, min_payload))
    }

    /// Find a free chunk of at least `min_size` bytes, growing the heap if necessary.
    pub fn find_or_grow_free_chunk(&self, min_size: usize) -> Result<ChunkRef<'_>, Error> {
        self.mutate(|ledger| ledger.find_or_grow_free_chunk(min_size))
    }

    /// Split a chunk, keeping `keep` bytes in place, and return the new free remainder.
    ///
    /// Splitting a free chunk leaves two free neighbours. In strict mode, that pair is accepted
    /// until the next operation, which is expected to claim one of them or merge them back. A
    /// second split while the pair is pending fails before writing anything.
    ///
    /// # Panics
    ///
    /// Panics if `keep` is unaligned or leaves too small a remainder, or if the chunk is not part
    /// of this heap.
    pub fn split_chunk<'g>(
        &'g self,
        chunk: ChunkRef<'g>,
        keep: usize,
    ) -> Result<ChunkRef<'g>, Error> {
        self.adopt(chunk)?;

        self.mutate(|ledger| {
            ledger.settled()?;

            let rest = ledger.split_chunk(chunk, keep)?;
            ledger.loosen(rest);

            Ok(rest)
        })
    }

    /// Merge `second` into `first`, which must be its left neighbour.
    ///
    /// Merging into a sentinel is a no-op returning `first`.
    ///
    /// # Panics
    ///
    /// Panics if `second` is not `first`'s next chunk, or either is not part of this heap.
    pub fn merge_chunks<'g>(
        &'g self,
        first: ChunkRef<'g>,
        second: ChunkRef<'g>,
    ) -> Result<ChunkRef<'g>, Error> {
        self.adopt(first)?;
        self.adopt(second)?;

        self.mutate(|ledger| {
            let loose = ledger.loose();
            // Absorbing a used chunk can bring a free `first` up against a free chunk.
            let joined = match second.next() {
                Some(after)
                    if first.is_free() && second.tag() == Ok(Tag::Used) && after.is_free() =>
                {
                    Some(after)
                }
                _ => None,
            };

            if let (Some(after), Some(loose)) = (joined, loose) {
                if loose != first && loose != after {
                    return Err(Error::corruption(after.addr(), Fault::AdjacentFree));
                }
            }

            let res = ledger.merge_chunks(first, second)?;
            if loose == Some(second) || (joined.is_some() && loose.is_none()) {
                ledger.loosen(res);
            }

            Ok(res)
        })
    }

    /// Mark a free chunk used.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is not part of this heap.
    pub fn claim_chunk(&self, chunk: ChunkRef) -> Result<(), Error> {
        self.adopt(chunk)?;

        self.mutate(|ledger| ledger.claim_chunk(chunk))
    }

    /// Release a used chunk, coalescing it with its free neighbours.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is not part of this heap.
    pub fn release_chunk<'g>(&'g self, chunk: ChunkRef<'g>) -> Result<ChunkRef<'g>, Error> {
        self.adopt(chunk)?;

        self.mutate(|ledger| {
            let loose = ledger.loose();
            let touched = loose.is_some() && (loose == chunk.prev() || loose == chunk.next());

            let res = ledger.release_chunk(chunk)?;
            if touched {
                ledger.loosen(res);
            }

            Ok(res)
        })
    }
}
