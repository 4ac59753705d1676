//! Chunk headers.
//!
//! Chunks are the main unit of the memory bookkeeping. A chunk is a fixed-size header, directly
//! followed by its payload. Headers are linked into an address-ordered chain per region.

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::{fmt, mem, ptr};

use crate::fail::{Error, Fault};
use crate::ptr::{into_raw, Pointer};

/// The magic word of a free chunk.
const MAGIC_FREE: usize = 0xF2EE_C4A0;
/// The magic word of a used chunk.
const MAGIC_USED: usize = 0x05ED_C4A1;
/// The magic word of a region header.
const MAGIC_REGION_HEADER: usize = 0xB16C_4A02;
/// The magic word of a region sentinel.
const MAGIC_REGION_SENTINEL: usize = 0xE4DC_4A03;
/// The magic word written over headers that were merged away.
const MAGIC_DEAD: usize = 0;

/// The size of a chunk header, in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<Chunk>();
/// The alignment of every chunk header and payload.
///
/// This is the natural pointer alignment of the host.
pub const ALIGN: usize = mem::align_of::<Chunk>();

// Payloads follow headers directly, so the header must keep them aligned.
const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(ALIGN == mem::align_of::<usize>());

/// Round `n` up to a multiple of `align`, a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    match n.checked_add(align - 1) {
        Some(n) => Some(n & !(align - 1)),
        None => None,
    }
}

/// The state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Available for allocation.
    Free,
    /// Handed out by the policy layer.
    Used,
    /// The first chunk of a region. Its size is the size of the whole region.
    RegionHeader,
    /// The zero-sized terminator of a region.
    RegionSentinel,
}

impl Tag {
    /// The word representing this tag in memory.
    #[inline]
    pub const fn magic(self) -> usize {
        match self {
            Tag::Free => MAGIC_FREE,
            Tag::Used => MAGIC_USED,
            Tag::RegionHeader => MAGIC_REGION_HEADER,
            Tag::RegionSentinel => MAGIC_REGION_SENTINEL,
        }
    }

    /// Decode a magic word.
    ///
    /// Returns `None` if the word is none of the valid tags.
    #[inline]
    pub fn from_magic(magic: usize) -> Option<Tag> {
        match magic {
            MAGIC_FREE => Some(Tag::Free),
            MAGIC_USED => Some(Tag::Used),
            MAGIC_REGION_HEADER => Some(Tag::RegionHeader),
            MAGIC_REGION_SENTINEL => Some(Tag::RegionSentinel),
            _ => None,
        }
    }
}

/// A chunk header, as laid out in memory.
#[repr(C)]
pub struct Chunk {
    /// The tag, as a magic word.
    magic: usize,
    /// The payload size, or the region size for a region header.
    size: usize,
    /// The previous chunk (or region, for a region header).
    prev: *mut Chunk,
    /// The next chunk (or region, for a region header).
    next: *mut Chunk,
}

impl Chunk {
    /// An unlinked header.
    #[inline]
    pub const fn new(tag: Tag, size: usize) -> Chunk {
        Chunk {
            magic: tag.magic(),
            size,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// A handle to a chunk header living in heap memory.
///
/// Handles are created by the ledger and borrow it: they cannot outlive the lock guard (or ledger
/// reference) they came from, so they are only ever read under the heap lock. After the chunk is
/// merged away the handle reads a dead header; in strict mode its tag no longer decodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRef<'a> {
    /// The header.
    ptr: Pointer<Chunk>,
    _ledger: PhantomData<&'a Chunk>,
}

impl<'a> ChunkRef<'a> {
    /// Wrap a pointer to an existing header.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized header in memory which stays mapped for the life of the
    /// heap.
    #[inline]
    pub(crate) unsafe fn from_ptr(ptr: Pointer<Chunk>) -> ChunkRef<'a> {
        debug_assert!(ptr.aligned_to(ALIGN), "Unaligned chunk header.");

        ChunkRef {
            ptr,
            _ledger: PhantomData,
        }
    }

    /// Write a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned, and valid for writing a whole header.
    #[inline]
    pub(crate) unsafe fn write(
        at: Pointer<u8>,
        tag: Tag,
        size: usize,
        prev: Option<ChunkRef<'a>>,
        next: Option<ChunkRef<'a>>,
    ) -> ChunkRef<'a> {
        let ptr = at.cast::<Chunk>();
        ptr::write(
            ptr.get(),
            Chunk {
                magic: tag.magic(),
                size,
                prev: into_raw(prev.map(|c| c.ptr)),
                next: into_raw(next.map(|c| c.ptr)),
            },
        );

        ChunkRef::from_ptr(ptr)
    }

    /// Get the chunk owning a payload.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by the policy layer of a heap which still exists, and the
    /// handle must only be used while that heap is locked.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> ChunkRef<'a> {
        ChunkRef::from_ptr(Pointer::new(payload.as_ptr()).byte_sub(HEADER_SIZE).cast())
    }

    /// The header pointer.
    #[inline]
    pub(crate) fn as_ptr(self) -> Pointer<Chunk> {
        self.ptr
    }

    /// The address of the header.
    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.addr()
    }

    /// The raw magic word, undecoded.
    #[inline]
    pub fn magic(self) -> usize {
        unsafe { (*self.ptr.get()).magic }
    }

    /// The tag of this chunk.
    ///
    /// A magic word which is none of the valid tags is reported as corruption.
    #[inline]
    pub fn tag(self) -> Result<Tag, Error> {
        Tag::from_magic(self.magic())
            .ok_or_else(|| Error::corruption(self.addr(), Fault::BadTag(self.magic())))
    }

    /// Check the tag against an expected one.
    #[inline]
    pub fn expect(self, tag: Tag) -> Result<(), Error> {
        let found = self.tag()?;
        if found == tag {
            Ok(())
        } else {
            Err(Error::corruption(self.addr(), Fault::UnexpectedTag(found)))
        }
    }

    /// Is this chunk free?
    ///
    /// A chunk with a broken tag is not free.
    #[inline]
    pub fn is_free(self) -> bool {
        self.magic() == MAGIC_FREE
    }

    /// The payload size, in bytes.
    #[inline]
    pub fn size(self) -> usize {
        unsafe { (*self.ptr.get()).size }
    }

    /// The previous chunk in the chain.
    #[inline]
    pub fn prev(self) -> Option<ChunkRef<'a>> {
        Pointer::from_raw(unsafe { (*self.ptr.get()).prev }).map(|ptr| self.at(ptr))
    }

    /// The next chunk in the chain.
    #[inline]
    pub fn next(self) -> Option<ChunkRef<'a>> {
        Pointer::from_raw(unsafe { (*self.ptr.get()).next }).map(|ptr| self.at(ptr))
    }

    /// A handle to another header of the same heap.
    #[inline]
    fn at(self, ptr: Pointer<Chunk>) -> ChunkRef<'a> {
        ChunkRef {
            ptr,
            _ledger: PhantomData,
        }
    }

    /// The next chunk, which every chunk but a sentinel has.
    #[inline]
    pub(crate) fn next_or_broken(self) -> Result<ChunkRef<'a>, Error> {
        self.next()
            .ok_or_else(|| Error::corruption(self.addr(), Fault::BrokenLink))
    }

    /// The start of the payload.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { self.ptr.cast::<u8>().byte_add(HEADER_SIZE).as_non_null() }
    }

    /// The address right after the payload.
    #[inline]
    pub fn end(self) -> usize {
        self.addr() + HEADER_SIZE + self.size()
    }

    /// Set the tag.
    #[inline]
    pub(crate) fn set_tag(self, tag: Tag) {
        unsafe { (*self.ptr.get()).magic = tag.magic() }
    }

    /// Set the payload size.
    #[inline]
    pub(crate) fn set_size(self, size: usize) {
        unsafe { (*self.ptr.get()).size = size }
    }

    /// Set the previous link.
    #[inline]
    pub(crate) fn set_prev(self, prev: Option<ChunkRef<'a>>) {
        unsafe { (*self.ptr.get()).prev = into_raw(prev.map(|c| c.ptr)) }
    }

    /// Set the next link.
    #[inline]
    pub(crate) fn set_next(self, next: Option<ChunkRef<'a>>) {
        unsafe { (*self.ptr.get()).next = into_raw(next.map(|c| c.ptr)) }
    }

    /// Mark this header as dead, so stale handles are caught.
    #[inline]
    pub(crate) fn kill(self) {
        unsafe { (*self.ptr.get()).magic = MAGIC_DEAD }
    }
}

impl<'a> fmt::Debug for ChunkRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match Tag::from_magic(self.magic()) {
            Some(tag) => write!(f, "0x{:x}[{:?}; 0x{:x}]", self.addr(), tag, self.size()),
            None => write!(f, "0x{:x}[0x{:x}?]", self.addr(), self.magic()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A few headers worth of aligned scratch memory.
    fn scratch() -> Box<[Chunk; 4]> {
        Box::new([
            Chunk::new(Tag::Free, 0),
            Chunk::new(Tag::Free, 0),
            Chunk::new(Tag::Free, 0),
            Chunk::new(Tag::Free, 0),
        ])
    }

    #[test]
    fn test_tags() {
        for &tag in &[Tag::Free, Tag::Used, Tag::RegionHeader, Tag::RegionSentinel] {
            assert_eq!(Tag::from_magic(tag.magic()), Some(tag));
        }

        assert_eq!(Tag::from_magic(MAGIC_DEAD), None);
        assert_eq!(Tag::from_magic(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_layout() {
        assert_eq!(HEADER_SIZE, 4 * mem::size_of::<usize>());
        assert_eq!(ALIGN, mem::size_of::<usize>());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_header() {
        let mut mem = scratch();
        let base = unsafe { Pointer::new(mem.as_mut_ptr()).cast::<u8>() };

        unsafe {
            let first = ChunkRef::write(base, Tag::Used, HEADER_SIZE, None, None);
            let second =
                ChunkRef::write(base.byte_add(2 * HEADER_SIZE), Tag::Free, 0, Some(first), None);
            first.set_next(Some(second));

            assert_eq!(first.tag(), Ok(Tag::Used));
            assert_eq!(first.next(), Some(second));
            assert_eq!(second.prev(), Some(first));
            assert_eq!(first.end(), second.addr());
            assert_eq!(ChunkRef::from_payload(first.payload()), first);
            assert!(second.is_free());
            assert!(second.expect(Tag::Free).is_ok());
            assert_eq!(
                second.expect(Tag::Used),
                Err(Error::corruption(second.addr(), Fault::UnexpectedTag(Tag::Free)))
            );

            second.kill();
            assert_eq!(second.tag(), Err(Error::corruption(second.addr(), Fault::BadTag(0))));
            assert!(!second.is_free());
        }
    }
}
