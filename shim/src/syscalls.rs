//! System calls.

use core::ptr;

use crate::config;

/// Map `count` fresh pages of anonymous, private, read-write memory.
///
/// The returned pointer is aligned to `config::PAGE_SIZE`. On failure (including a byte count that
/// does not fit in `usize`), a null pointer is returned.
///
/// # Note
///
/// The mapping is never released again.
pub fn map_pages(count: usize) -> *mut u8 {
    let len = match count.checked_mul(config::PAGE_SIZE) {
        Some(0) | None => return ptr::null_mut(),
        Some(len) => len,
    };

    let res = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if res == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        res as *mut u8
    }
}

/// Voluntarily give a time slice to the scheduler.
pub fn sched_yield() -> i32 {
    unsafe { libc::sched_yield() }
}

/// Write a string to the log target.
///
/// Returns the number of bytes written, or `-1` on error.
pub fn log(s: &str) -> isize {
    unsafe { libc::write(config::LOG_TARGET, s.as_ptr() as *const libc::c_void, s.len()) }
}

/// Abort the process immediately.
pub fn abort() -> ! {
    unsafe { libc::abort() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_map_pages() {
        let ptr = map_pages(2);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % config::PAGE_SIZE, 0);

        unsafe {
            *ptr = 0xAA;
            *ptr.add(2 * config::PAGE_SIZE - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
        }
    }

    #[test]
    fn test_map_overflow() {
        assert!(map_pages(usize::MAX).is_null());
        assert!(map_pages(0).is_null());
    }
}
