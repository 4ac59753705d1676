//! Property-based tests for the heap.
//!
//! Random sequences of allocations, resizes and releases are run against a local heap, checking
//! after every step that the heap validates and that live allocations keep their contents. The
//! ledger primitives get the same treatment on their own, through a lock guard.

use std::pin::Pin;
use std::ptr::NonNull;

use chunkalloc::{
    config, ChunkRef, Error, Fault, Heap, Ledger, NoLock, StaticPages, Tag, ALIGN, HEADER_SIZE,
};
use proptest::prelude::*;

const PAGES: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: usize, align_shift: u32 },
    Release { index: usize },
    Resize { index: usize, size: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3000, 0u32..10)
            .prop_map(|(size, align_shift)| Op::Allocate { size, align_shift }),
        3 => any::<usize>().prop_map(|index| Op::Release { index }),
        2 => (any::<usize>(), 0usize..6000).prop_map(|(index, size)| Op::Resize { index, size }),
    ]
}

#[derive(Debug, Clone)]
enum Step {
    Grow { after: usize, payload: usize },
    Split { index: usize, point: u8 },
    Merge { index: usize },
    Claim { index: usize },
    Release { index: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => (any::<usize>(), 0usize..3 * config::PAGE_SIZE)
            .prop_map(|(after, payload)| Step::Grow { after, payload }),
        4 => (any::<usize>(), any::<u8>()).prop_map(|(index, point)| Step::Split { index, point }),
        3 => any::<usize>().prop_map(|index| Step::Merge { index }),
        3 => any::<usize>().prop_map(|index| Step::Claim { index }),
        3 => any::<usize>().prop_map(|index| Step::Release { index }),
    ]
}

/// Every header of the heap, as raw words.
fn headers(ledger: &Ledger<StaticPages>) -> Vec<[usize; 5]> {
    let mut res = Vec::new();
    for region in ledger.regions() {
        let region = region.unwrap();
        let chunks = region.chunks().map(Result::unwrap);

        for chunk in std::iter::once(region.header()).chain(chunks) {
            res.push([
                chunk.addr(),
                chunk.magic(),
                chunk.size(),
                chunk.prev().map_or(0, ChunkRef::addr),
                chunk.next().map_or(0, ChunkRef::addr),
            ]);
        }
    }

    res
}

/// A live allocation, filled with its tag byte.
struct Live {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    tag: u8,
}

impl Live {
    fn fill(&self) {
        unsafe { self.ptr.as_ptr().write_bytes(self.tag, self.size) }
    }

    fn intact(&self) -> bool {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
            .iter()
            .all(|&b| b == self.tag)
    }
}

fn heap() -> Pin<Box<Heap<StaticPages, NoLock>>> {
    let mem = Box::leak(vec![0u8; (PAGES + 1) * config::PAGE_SIZE].into_boxed_slice());
    let heap = Box::pin(Heap::new(StaticPages::new(mem)));
    heap.as_ref().set_strict(true);

    heap
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every step leaves a valid heap, and no allocation is overwritten by another.
    #[test]
    fn heap_stays_consistent(ops in prop::collection::vec(op(), 1..120)) {
        let heap = heap();
        let heap = heap.as_ref();
        let mut live: Vec<Live> = Vec::new();
        let mut tag = 0u8;

        for op in ops {
            match op {
                Op::Allocate { size, align_shift } => {
                    let align = 1 << align_shift;
                    match heap.allocate(size, align) {
                        Ok(ptr) => {
                            prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
                            prop_assert!(unsafe { heap.usable_size(ptr) }.unwrap() >= size, "assertion failed: usable_size(ptr) >= size");

                            tag = tag.wrapping_add(1);
                            let alloc = Live { ptr, size, align, tag };
                            alloc.fill();
                            live.push(alloc);
                        }
                        Err(err) => prop_assert!(matches!(err, Error::OutOfMemory { .. }), "assertion failed: err is Error::OutOfMemory"),
                    }
                }
                Op::Release { index } => {
                    if live.is_empty() {
                        continue;
                    }
                    let alloc = live.swap_remove(index % live.len());
                    prop_assert!(alloc.intact());
                    unsafe { heap.release(alloc.ptr) }.unwrap();
                }
                Op::Resize { index, size } => {
                    if live.is_empty() {
                        continue;
                    }
                    let index = index % live.len();
                    let alloc = &mut live[index];

                    match unsafe { heap.resize(alloc.ptr, size, alloc.align) } {
                        Ok(ptr) => {
                            prop_assert_eq!(ptr.as_ptr() as usize % alloc.align, 0);
                            alloc.ptr = ptr;
                            // The common prefix moves along.
                            alloc.size = alloc.size.min(size);
                            prop_assert!(alloc.intact());
                            alloc.size = size;
                            alloc.fill();
                        }
                        Err(err) => {
                            prop_assert!(matches!(err, Error::OutOfMemory { .. }), "assertion failed: err is Error::OutOfMemory");
                            prop_assert!(alloc.intact());
                        }
                    }
                }
            }

            let stats = heap.validate().unwrap();
            prop_assert_eq!(stats.used_chunks, live.len());
            for alloc in &live {
                prop_assert!(alloc.intact());
            }

            // Every byte of every region is a header or a payload.
            let headers = stats.free_chunks + stats.used_chunks + 2 * stats.regions;
            prop_assert_eq!(
                stats.free_bytes + stats.used_bytes + headers * HEADER_SIZE,
                stats.mapped_bytes
            );
        }

        for alloc in live {
            unsafe { heap.release(alloc.ptr) }.unwrap();
        }

        // Releasing everything coalesces every region back into a single chunk.
        let stats = heap.validate().unwrap();
        prop_assert_eq!(stats.used_chunks, 0);
        prop_assert_eq!(stats.free_chunks, stats.regions);
    }

    /// Payloads are always word aligned and never smaller than requested.
    #[test]
    fn payload_sizes(sizes in prop::collection::vec(0usize..5000, 1..40)) {
        let heap = heap();
        let heap = heap.as_ref();

        for size in sizes {
            let ptr = match heap.allocate(size, 1) {
                Ok(ptr) => ptr,
                Err(_) => break,
            };
            let usable = unsafe { heap.usable_size(ptr) }.unwrap();

            prop_assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
            prop_assert_eq!(usable % ALIGN, 0);
            prop_assert!(usable >= size.max(1));
            prop_assert!(usable < size.max(1) + HEADER_SIZE + config::MIN_REMAINDER + ALIGN);
        }
    }

    /// Any sequence of ledger primitives keeps the chains contiguous and the free chunks apart,
    /// and an operation which fails leaves every header as it was.
    #[test]
    fn ledger_stays_consistent(steps in prop::collection::vec(step(), 1..150)) {
        let heap = heap();
        let ledger = heap.as_ref().lock();

        for step in steps {
            let chunks: Vec<ChunkRef> = ledger
                .regions()
                .flat_map(|region| region.unwrap().chunks())
                .map(Result::unwrap)
                .filter(|chunk| chunk.tag() != Ok(Tag::RegionSentinel))
                .collect();
            let free: Vec<ChunkRef> = chunks.iter().copied().filter(|c| c.is_free()).collect();
            let used: Vec<ChunkRef> =
                chunks.iter().copied().filter(|c| c.tag() == Ok(Tag::Used)).collect();
            let before = headers(&ledger);

            let res = match step {
                Step::Grow { after, payload } => {
                    let regions: Vec<_> = ledger.regions().map(Result::unwrap).collect();
                    ledger.grow_region(regions[after % regions.len()], payload).map(|_| ())
                }
                Step::Split { index, point } => {
                    if chunks.is_empty() {
                        continue;
                    }
                    let chunk = chunks[index % chunks.len()];
                    let room = match chunk.size().checked_sub(HEADER_SIZE + config::MIN_REMAINDER) {
                        Some(room) => room,
                        None => continue,
                    };
                    let keep = room * point as usize / 255 / ALIGN * ALIGN;

                    ledger.split_chunk(chunk, keep).map(|_| ())
                }
                Step::Merge { index } => {
                    if chunks.is_empty() {
                        continue;
                    }
                    let first = chunks[index % chunks.len()];

                    ledger.merge_chunks(first, first.next().unwrap()).map(|_| ())
                }
                Step::Claim { index } => {
                    if free.is_empty() {
                        continue;
                    }

                    ledger.claim_chunk(free[index % free.len()])
                }
                Step::Release { index } => {
                    if used.is_empty() {
                        continue;
                    }

                    ledger.release_chunk(used[index % used.len()]).map(|_| ())
                }
            };

            if let Err(err) = res {
                prop_assert!(
                    matches!(
                        err,
                        Error::OutOfMemory { .. }
                            | Error::Corruption { fault: Fault::AdjacentFree, .. }
                    ),
                    "{:?}",
                    err
                );
                prop_assert_eq!(headers(&ledger), before);
            }

            let stats = ledger.validate();
            prop_assert!(stats.is_ok(), "{:?}", stats);
            let stats = stats.unwrap();

            // Only the loose remainder of a split may have a free neighbour.
            let loose = ledger.loose();
            for region in ledger.regions() {
                let mut prev: Option<ChunkRef> = None;
                for chunk in region.unwrap().chunks() {
                    let chunk = chunk.unwrap();
                    if let Some(prev) = prev {
                        prop_assert_eq!(prev.end(), chunk.addr());
                        if prev.is_free() && chunk.is_free() {
                            prop_assert!(loose == Some(prev) || loose == Some(chunk));
                        }
                    }
                    prev = Some(chunk);
                }
            }

            let count = stats.free_chunks + stats.used_chunks + 2 * stats.regions;
            prop_assert_eq!(
                stats.free_bytes + stats.used_bytes + count * HEADER_SIZE,
                stats.mapped_bytes
            );
        }

        // Merging the loose remainder away settles the heap.
        while let Some(loose) = ledger.loose() {
            match loose.prev() {
                Some(prev) if prev.is_free() => ledger.merge_chunks(prev, loose).unwrap(),
                _ => ledger.merge_chunks(loose, loose.next().unwrap()).unwrap(),
            };
        }
        prop_assert!(ledger.validate().is_ok());
    }
}
