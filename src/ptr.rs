//! Pointer wrappers.

use core::ptr::NonNull;
use core::{cmp, fmt, hash};

/// A pointer wrapper type.
///
/// A wrapper around a raw non-null `*mut T`. Unlike a box, it does not own the referent: chunk
/// links point into regions, and regions belong to the heap for the rest of the process.
pub struct Pointer<T> {
    /// The internal pointer.
    ptr: NonNull<T>,
}

impl<T> Pointer<T> {
    /// Create a new `Pointer` from a raw pointer.
    ///
    /// # Safety
    ///
    /// This function is unsafe since a null pointer can cause UB, due to `Pointer` being
    /// non-nullable.
    #[inline]
    pub unsafe fn new(ptr: *mut T) -> Pointer<T> {
        // For the sake of nice debugging, make some assertions.
        debug_assert!(!ptr.is_null(), "Null pointer!");

        Pointer {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Create a `Pointer` from a possibly null raw pointer.
    #[inline]
    pub fn from_raw(ptr: *mut T) -> Option<Pointer<T>> {
        NonNull::new(ptr).map(|ptr| Pointer { ptr })
    }

    /// Get the inner raw pointer.
    #[inline]
    pub fn get(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Get the inner pointer as `NonNull`.
    #[inline]
    pub fn as_non_null(self) -> NonNull<T> {
        self.ptr
    }

    /// The address this pointer points to.
    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Cast this pointer into a pointer to another type.
    ///
    /// This leaves the address unmodified.
    #[inline]
    pub fn cast<U>(self) -> Pointer<U> {
        Pointer {
            ptr: self.ptr.cast(),
        }
    }

    /// Offset this pointer by some number of _bytes_.
    ///
    /// # Safety
    ///
    /// The result must stay within the allocation the pointer was derived from.
    #[inline]
    pub unsafe fn byte_add(self, bytes: usize) -> Pointer<T> {
        Pointer::new((self.ptr.as_ptr() as *mut u8).add(bytes) as *mut T)
    }

    /// Offset this pointer backwards by some number of _bytes_.
    ///
    /// # Safety
    ///
    /// The result must stay within the allocation the pointer was derived from.
    #[inline]
    pub unsafe fn byte_sub(self, bytes: usize) -> Pointer<T> {
        Pointer::new((self.ptr.as_ptr() as *mut u8).sub(bytes) as *mut T)
    }

    /// Is this pointer aligned to `align`?
    #[inline]
    pub fn aligned_to(self, align: usize) -> bool {
        self.addr() % align == 0
    }
}

/// Turn an optional pointer back into a raw (possibly null) one.
#[inline]
pub fn into_raw<T>(ptr: Option<Pointer<T>>) -> *mut T {
    ptr.map_or(core::ptr::null_mut(), Pointer::get)
}

impl<T> Clone for Pointer<T> {
    #[inline]
    fn clone(&self) -> Pointer<T> {
        *self
    }
}

impl<T> Copy for Pointer<T> {}

impl<T> PartialEq for Pointer<T> {
    #[inline]
    fn eq(&self, other: &Pointer<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Pointer<T> {}

impl<T> PartialOrd for Pointer<T> {
    #[inline]
    fn partial_cmp(&self, other: &Pointer<T>) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare the addresses.
impl<T> Ord for Pointer<T> {
    #[inline]
    fn cmp(&self, other: &Pointer<T>) -> cmp::Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T> hash::Hash for Pointer<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T> fmt::Debug for Pointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.addr())
    }
}
