//! Synchronization primitives.

use core::cell::{Cell, UnsafeCell};
use core::ops;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sys;

/// The heap lock.
///
/// Every mutation of the region registry or the chunk ledger, and every traversal of them, happens
/// between `acquire` and `release`. The lock is exclusive and not reentrant.
///
/// # Safety
///
/// Implementors must guarantee that, between an `acquire` and the matching `release`, no other
/// `acquire` on the same lock returns. A lock which cannot guarantee this across threads must not
/// be `Sync`.
pub unsafe trait HeapLock {
    /// A lock in the released state.
    const INIT: Self;

    /// Acquire the lock.
    ///
    /// If the lock is held elsewhere, this blocks until it is released.
    fn acquire(&self);

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must currently be held by the caller.
    unsafe fn release(&self);
}

/// A spinning lock, which yields the time slice while waiting.
pub struct SpinLock {
    /// The lock boolean.
    ///
    /// This is true, if and only if the lock is currently held.
    locked: AtomicBool,
}

unsafe impl HeapLock for SpinLock {
    const INIT: SpinLock = SpinLock {
        locked: AtomicBool::new(false),
    };

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // ,___,
            // {O,o}
            // |)``)
            // SRSLY?
            sys::yield_now();
        }
    }

    unsafe fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// The lock of a single-threaded heap.
///
/// This does no synchronization at all, and is therefore not `Sync`. It still refuses to be
/// acquired twice, since that would hand out two mutable views of the heap.
pub struct NoLock {
    /// Is the lock held?
    held: Cell<bool>,
}

unsafe impl HeapLock for NoLock {
    const INIT: NoLock = NoLock {
        held: Cell::new(false),
    };

    #[inline]
    fn acquire(&self) {
        assert!(!self.held.replace(true), "The heap lock is not reentrant.");
    }

    #[inline]
    unsafe fn release(&self) {
        self.held.set(false);
    }
}

/// A mutual exclusive container.
///
/// This assures that only one holds mutability of the inner value. To get the inner value, you
/// need acquire the "lock". If you try to lock it while a lock is already held elsewhere, it will
/// block the thread until the lock is released.
pub struct Mutex<T, L: HeapLock = SpinLock> {
    /// The lock.
    lock: L,
    /// The inner value.
    inner: UnsafeCell<T>,
}

/// A mutex guard.
///
/// This acts as the lock. It is released when the guard goes out of scope, including on early
/// returns.
pub struct MutexGuard<'a, T, L: HeapLock> {
    mutex: &'a Mutex<T, L>,
}

/// Release the mutex.
impl<'a, T, L: HeapLock> Drop for MutexGuard<'a, T, L> {
    fn drop(&mut self) {
        unsafe {
            // The guard exists, so the lock is held by us.
            self.mutex.lock.release();
        }
    }
}

impl<'a, T, L: HeapLock> ops::Deref for MutexGuard<'a, T, L> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.inner.get() }
    }
}

impl<'a, T, L: HeapLock> ops::DerefMut for MutexGuard<'a, T, L> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.inner.get() }
    }
}

impl<T, L: HeapLock> Mutex<T, L> {
    /// Create a new mutex with some inner value.
    pub const fn new(inner: T) -> Mutex<T, L> {
        Mutex {
            lock: L::INIT,
            inner: UnsafeCell::new(inner),
        }
    }

    /// Lock this mutex.
    ///
    /// If another lock is held, this will block the thread until it is released.
    pub fn lock(&self) -> MutexGuard<T, L> {
        self.lock.acquire();

        MutexGuard { mutex: self }
    }
}

unsafe impl<T: Send, L: HeapLock + Sync> Sync for Mutex<T, L> {}
