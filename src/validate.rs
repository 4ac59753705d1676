//! Heap validation.
//!
//! A full walk over every region and chunk, checking the structural guarantees of the ledger. The
//! walk never follows a link it has not verified first, so it stays inside the heap even when the
//! heap is scribbled over.

use shim::config;

use crate::chunk::{ChunkRef, Tag, ALIGN, HEADER_SIZE};
use crate::fail::{Error, Fault};
use crate::ledger::Ledger;
use crate::region::Region;

/// Statistics gathered by a validating walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Regions obtained from the page provider.
    pub regions: usize,
    /// Bytes obtained from the page provider.
    pub mapped_bytes: usize,
    /// Free chunks.
    pub free_chunks: usize,
    /// Payload bytes in free chunks.
    pub free_bytes: usize,
    /// Used chunks.
    pub used_chunks: usize,
    /// Payload bytes in used chunks.
    pub used_bytes: usize,
}

impl<P> Ledger<P> {
    /// Walk the whole heap and check it.
    ///
    /// The first violation found is returned as `Error::Corruption`, with the address of the
    /// offending header. The loose remainder of the last split (see `loose`) may sit next to a
    /// free chunk.
    pub fn validate(&self) -> Result<HeapStats, Error> {
        let head = self.head();
        let loose = self.loose();
        let mut stats = HeapStats::default();
        let mut prev: Option<Region> = None;

        for region in self.regions() {
            let region = region?;
            let size = region.size();

            if region.header().prev() != prev.map(Region::header) {
                return Err(Error::corruption(region.addr(), Fault::BrokenLink));
            }

            if region == head {
                if size != 2 * HEADER_SIZE {
                    return Err(Error::corruption(region.addr(), Fault::RegionSize(size)));
                }
            } else {
                if region.addr() % config::PAGE_SIZE != 0 {
                    return Err(Error::corruption(region.addr(), Fault::Misaligned));
                }
                if size % config::PAGE_SIZE != 0
                    || size < config::MIN_REGION_PAGES * config::PAGE_SIZE
                {
                    return Err(Error::corruption(region.addr(), Fault::RegionSize(size)));
                }

                stats.regions += 1;
                stats.mapped_bytes += size;
            }

            validate_region(region, loose, &mut stats)?;
            prev = Some(region);
        }

        Ok(stats)
    }
}

/// Check the chunk chain of a single region.
fn validate_region<'a>(
    region: Region<'a>,
    loose: Option<ChunkRef<'a>>,
    stats: &mut HeapStats,
) -> Result<(), Error> {
    // The region size is checked, so this is in bounds.
    let limit = region.addr() + region.size() - HEADER_SIZE;
    let mut expected = region.addr() + HEADER_SIZE;
    let mut prev: Option<ChunkRef> = None;

    for chunk in region.chunks() {
        let chunk = chunk?;
        let addr = chunk.addr();

        if addr != expected {
            return Err(Error::corruption(addr, Fault::Gap { expected }));
        }
        if chunk.prev() != prev {
            return Err(Error::corruption(addr, Fault::BrokenLink));
        }

        match chunk.tag()? {
            Tag::RegionSentinel => {
                if chunk.size() != 0 {
                    return Err(Error::corruption(addr, Fault::SentinelSize(chunk.size())));
                }
                if addr != limit {
                    return Err(Error::corruption(addr, Fault::Overrun));
                }
                if chunk.next().is_some() {
                    return Err(Error::corruption(addr, Fault::BrokenLink));
                }

                return Ok(());
            }
            Tag::Free => {
                if prev.map_or(false, ChunkRef::is_free) && loose != Some(chunk) && loose != prev {
                    return Err(Error::corruption(addr, Fault::AdjacentFree));
                }

                stats.free_chunks += 1;
                stats.free_bytes += chunk.size();
            }
            Tag::Used => {
                stats.used_chunks += 1;
                stats.used_bytes += chunk.size();
            }
            tag => return Err(Error::corruption(addr, Fault::UnexpectedTag(tag))),
        }

        if chunk.size() % ALIGN != 0 {
            return Err(Error::corruption(addr, Fault::Misaligned));
        }
        // The sentinel must still fit behind it.
        match limit.checked_sub(addr + HEADER_SIZE) {
            Some(room) if chunk.size() <= room => {}
            _ => return Err(Error::corruption(addr, Fault::Overrun)),
        }
        if chunk.next().map(ChunkRef::addr) != Some(chunk.end()) {
            return Err(Error::corruption(addr, Fault::BrokenLink));
        }

        expected = chunk.end();
        prev = Some(chunk);
    }

    // The chain ended without a sentinel.
    Err(Error::corruption(expected, Fault::BrokenLink))
}
