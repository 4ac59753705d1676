#[global_allocator]
static ALLOCATOR: chunkalloc::Allocator = chunkalloc::Allocator;

mod util;

#[inline(never)]
fn alloc_box() -> Box<u32> {
    Box::new(0xDEADBEAF)
}

#[test]
fn simple_box() {
    util::multiply(|| {
        let mut a = Box::new(1);
        let mut b = Box::new(2);
        let mut c = Box::new(3);

        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert_eq!(*c, 3);
        assert_eq!(*alloc_box(), 0xDEADBEAF);

        util::acid(|| {
            *a = 0;
            *b = 0;
            *c = 0;
        });
        assert_eq!(*a, 0);
        assert_eq!(*b, 0);
        assert_eq!(*c, 0);
    });
}

#[test]
fn aligned_box() {
    #[repr(align(256))]
    struct Page([u8; 300]);

    util::multiply(|| {
        let a = Box::new(Page([1; 300]));
        let b = Box::new(Page([2; 300]));

        assert_eq!(&*a as *const Page as usize % 256, 0);
        assert_eq!(&*b as *const Page as usize % 256, 0);
        assert!(a.0.iter().all(|&x| x == 1));
        assert!(b.0.iter().all(|&x| x == 2));
    });
}
