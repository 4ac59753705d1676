#[global_allocator]
static ALLOCATOR: chunkalloc::Allocator = chunkalloc::Allocator;

mod util;

use std::mem;

#[test]
fn simple_vec() {
    let baseline = chunkalloc::validate().unwrap();

    util::multiply(|| {
        let mut vec = Vec::new();

        for i in 0..0xFFFF {
            let _bx = Box::new(4);
            vec.push(i);
        }

        let stats = chunkalloc::validate().unwrap();
        assert!(stats.used_bytes >= vec.capacity() * mem::size_of::<i32>());

        assert_eq!(vec[0xDEAD], 0xDEAD);
        assert_eq!(vec[0xBEAF], 0xBEAF);
        assert_eq!(vec[0xABCD], 0xABCD);
        assert_eq!(vec[0xFFAB], 0xFFAB);

        for i in (0xFFF0..0xFFFF).rev() {
            util::acid(|| {
                assert_eq!(vec.pop(), Some(i));
            });
        }

        // Shrinking gives the tail back without moving the buffer.
        let ptr = vec.as_ptr();
        vec.truncate(0x1000);
        vec.shrink_to_fit();
        assert_eq!(vec.as_ptr(), ptr);
        assert_eq!(vec[0xFFF], 0xFFF);
    });

    // Every buffer was released, and the heap coalesced around them.
    let stats = chunkalloc::validate().unwrap();
    assert!(stats.used_bytes < baseline.used_bytes + 0xFFFF * mem::size_of::<i32>());
    assert!(stats.free_chunks <= stats.used_chunks + stats.regions);
}
