//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and traits that express their behaviors.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Lock operations a `Lock` delegates to.
pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);

    /// Releases the lock.
    fn release(&self);

    /// Checks whether this thread is holding the lock.
    fn holding(&self) -> bool;
}

/// Represents lock guards that can be slept in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner lock.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a pair,
    /// for temporarily releasing and then re-acquiring the lock. Do not
    /// access the protected data in between.
    unsafe fn raw_release(&mut self);

    /// Acquires the inner lock.
    ///
    /// # Safety
    ///
    /// See `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

/// A lock that owns its `RawLock` and the data it protects.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// The data is reachable from any thread, but only one at a time.
unsafe impl<R: RawLock + Send, T: Send> Sync for Lock<R, T> {}

/// # Safety
///
/// The guard exists only while its lock is held by the current thread.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    // Do not implement Send; the lock must be released on the thread that
    // acquired it.
    _marker: PhantomData<*const ()>,
}

unsafe impl<'s, R: RawLock, T: Sync> Sync for Guard<'s, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new_with_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Returns a mutable pointer to the inner data. The caller must ensure
    /// that accessing the pointer does not incur a race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a unique reference to the lock.
        unsafe { &mut *self.data.get() }
    }

    /// Unlocks the lock without a guard.
    ///
    /// # Safety
    ///
    /// Use only when the lock was acquired and its guard was forgotten.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock while running `f`, and re-acquires it
    /// after `f` returns. The data must not be accessed through `self`
    /// inside `f`.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
