//! The region registry.
//!
//! Regions ("big chunks") are the spans of memory obtained from the page provider. Each one starts
//! with a region header and ends with a zero-sized sentinel, with the payload chunks in between.
//! The headers are linked into the registry, which always starts at the zero-capacity head region
//! owned by the ledger.

use core::cmp;

use shim::config;

use crate::chunk::{align_up, ChunkRef, Tag, HEADER_SIZE};
use crate::fail::{Error, Fault};
use crate::ledger::Ledger;
use crate::ptr::Pointer;
use crate::sys::PageProvider;

/// Calculate the size of a region able to hold a payload of `min_payload` bytes.
///
/// Room is made for the region header, the payload chunk's header and the sentinel, so this is
/// `page_align(min_payload + 3 * HEADER_SIZE)` rather than the `2 * HEADER_SIZE` a region header
/// shared with the payload chunk would need. It is never less than `config::MIN_REGION_PAGES`
/// pages, and always at least `page_align(min_payload + 2 * HEADER_SIZE)`.
///
/// Returns `None` if the size does not fit in the address space.
pub fn region_size(min_payload: usize) -> Option<usize> {
    let size = min_payload.checked_add(3 * HEADER_SIZE)?;
    let size = align_up(size, config::PAGE_SIZE)?;

    Some(cmp::max(size, config::MIN_REGION_PAGES * config::PAGE_SIZE))
}

/// A region.
///
/// This is a view on the region header, borrowing the ledger like every chunk handle.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    /// The region header.
    header: ChunkRef<'a>,
}

impl<'a> Region<'a> {
    /// View a region header as a region.
    ///
    /// # Safety
    ///
    /// `header` must be a region header, followed by a well-formed region of `header.size()`
    /// bytes.
    #[inline]
    pub(crate) unsafe fn from_header(header: ChunkRef<'a>) -> Region<'a> {
        Region { header }
    }

    /// Lay out a fresh region in `size` bytes at `base`, and link it in after `after`.
    ///
    /// The region gets a single free chunk spanning all its capacity.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and valid for `size` bytes, and `size` a page multiple of at
    /// least `3 * HEADER_SIZE` bytes. `after` must be a live region.
    unsafe fn carve(base: Pointer<u8>, size: usize, after: Region<'a>) -> Region<'a> {
        let follower = after.next_region();
        let sentinel_ptr = base.byte_add(size - HEADER_SIZE);

        let header = ChunkRef::write(base, Tag::RegionHeader, size, Some(after.header), None);
        let sentinel = ChunkRef::write(sentinel_ptr, Tag::RegionSentinel, 0, None, None);
        let free = ChunkRef::write(
            base.byte_add(HEADER_SIZE),
            Tag::Free,
            size - 3 * HEADER_SIZE,
            None,
            Some(sentinel),
        );
        sentinel.set_prev(Some(free));

        // Link it into the registry.
        header.set_next(follower.map(|r| r.header));
        if let Some(follower) = follower {
            follower.header.set_prev(Some(header));
        }
        after.header.set_next(Some(header));

        Region { header }
    }

    /// The region header.
    #[inline]
    pub fn header(self) -> ChunkRef<'a> {
        self.header
    }

    /// The start address of the region.
    #[inline]
    pub fn addr(self) -> usize {
        self.header.addr()
    }

    /// The size of the whole region, headers included.
    #[inline]
    pub fn size(self) -> usize {
        self.header.size()
    }

    /// The first chunk after the header.
    ///
    /// In the head region, this is the sentinel.
    #[inline]
    pub fn first_chunk(self) -> ChunkRef<'a> {
        unsafe { ChunkRef::from_ptr(self.header.as_ptr().byte_add(HEADER_SIZE)) }
    }

    /// The sentinel ending the region.
    #[inline]
    pub fn sentinel(self) -> ChunkRef<'a> {
        unsafe { ChunkRef::from_ptr(self.header.as_ptr().byte_add(self.size() - HEADER_SIZE)) }
    }

    /// The next region in the registry.
    #[inline]
    pub fn next_region(self) -> Option<Region<'a>> {
        self.header.next().map(|header| Region { header })
    }

    /// The previous region in the registry.
    #[inline]
    pub fn prev_region(self) -> Option<Region<'a>> {
        self.header.prev().map(|header| Region { header })
    }

    /// Iterate over the chunks of this region, in address order, sentinel included.
    #[inline]
    pub fn chunks(self) -> Chunks<'a> {
        Chunks {
            cur: Some(self.first_chunk()),
        }
    }

    /// Does this region span `addr`?
    #[inline]
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.addr() && addr - self.addr() < self.size()
    }
}

impl<'a> core::fmt::Debug for Region<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Region(0x{:x}[0x{:x}])", self.addr(), self.size())
    }
}

/// An iterator over the chunks of a region.
///
/// Every chunk's tag is verified before its `next` link is followed; a bad tag ends the iteration
/// with an error.
pub struct Chunks<'a> {
    /// The chunk to yield next.
    cur: Option<ChunkRef<'a>>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<ChunkRef<'a>, Error>;

    fn next(&mut self) -> Option<Result<ChunkRef<'a>, Error>> {
        let cur = self.cur.take()?;

        match cur.tag() {
            Err(err) => Some(Err(err)),
            Ok(Tag::RegionSentinel) => Some(Ok(cur)),
            Ok(Tag::RegionHeader) => {
                Some(Err(Error::corruption(cur.addr(), Fault::UnexpectedTag(Tag::RegionHeader))))
            }
            Ok(_) => match cur.next() {
                Some(next) => {
                    self.cur = Some(next);
                    Some(Ok(cur))
                }
                None => Some(Err(Error::corruption(cur.addr(), Fault::BrokenLink))),
            },
        }
    }
}

/// An iterator over the regions of the registry, head region first.
pub struct Regions<'a> {
    /// The region to yield next.
    cur: Option<ChunkRef<'a>>,
}

impl<'a> Regions<'a> {
    /// Iterate from `head` onwards.
    pub(crate) fn new(head: Region<'a>) -> Regions<'a> {
        Regions {
            cur: Some(head.header),
        }
    }
}

impl<'a> Iterator for Regions<'a> {
    type Item = Result<Region<'a>, Error>;

    fn next(&mut self) -> Option<Result<Region<'a>, Error>> {
        let header = self.cur.take()?;

        if let Err(err) = header.expect(Tag::RegionHeader) {
            return Some(Err(err));
        }

        self.cur = header.next();
        Some(Ok(Region { header }))
    }
}

impl<P: PageProvider> Ledger<P> {
    /// The last region of the registry.
    pub fn last_region(&self) -> Result<Region<'_>, Error> {
        let mut last = self.head();
        for region in self.regions() {
            last = region?;
        }

        Ok(last)
    }

    /// The region of this ledger spanning `addr`, if any.
    pub fn region_of(&self, addr: usize) -> Result<Option<Region<'_>>, Error> {
        for region in self.regions() {
            let region = region?;
            if region.contains(addr) {
                return Ok(Some(region));
            }
        }

        Ok(None)
    }

    /// Obtain a fresh region from the page provider, and link it in after `after`.
    ///
    /// The region holds a single free chunk of at least `min_payload` bytes. On failure, nothing
    /// is changed.
    pub(crate) fn grow_region<'a>(
        &'a self,
        after: Region<'a>,
        min_payload: usize,
    ) -> Result<Region<'a>, Error> {
        let oom = Error::OutOfMemory {
            requested: min_payload,
        };

        after.header.expect(Tag::RegionHeader)?;
        let size = region_size(min_payload).ok_or(oom)?;

        log!(DEBUG, "Growing a region of {} bytes after {:?}.", size, after);

        let base = match self.request_pages(size / config::PAGE_SIZE) {
            Some(base) => base,
            None => {
                log!(WARNING, "Page provider failed to supply {} bytes.", size);
                return Err(oom);
            }
        };
        assert!(base.aligned_to(config::PAGE_SIZE), "Page provider returned unaligned memory.");

        let region = unsafe {
            // The provider guarantees the memory, and the size is a page multiple of at least
            // four pages.
            Region::carve(base, size, after)
        };

        log!(INTERNAL, "New {:?} with free chunk {:?}.", region, region.first_chunk());

        Ok(region)
    }
}
