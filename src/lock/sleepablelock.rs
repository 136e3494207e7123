//! Sleepable locks: spinlocks whose guards can block on a wait channel.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::{RawLock, RawSpinlock, Waitable};
use crate::proc::WaitChannel;

/// A spinlock paired with a `WaitChannel` so that its guard can release the
/// CPU while waiting for a condition on the protected data.
pub struct SleepableLock<T> {
    lock: RawSpinlock,
    /// Sleepers waiting for the protected condition.
    waitchannel: WaitChannel,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepableLock<T> {}

pub struct SleepableLockGuard<'s, T> {
    lock: &'s SleepableLock<T>,
    _marker: PhantomData<*const ()>,
}

unsafe impl<'s, T: Sync> Sync for SleepableLockGuard<'s, T> {}

impl<T> SleepableLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        self.lock.acquire();
        SleepableLockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable pointer to the inner data. The caller must ensure
    /// that accessing the pointer does not incur a race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a unique reference to the lock.
        unsafe { &mut *self.data.get() }
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Atomically releases the lock and sleeps on the lock's channel;
    /// re-acquires the lock when awakened.
    pub fn sleep(&mut self) {
        self.lock.waitchannel.sleep(self);
    }

    /// Wakes every process sleeping on the lock's channel.
    pub fn wakeup(&self) {
        self.lock.waitchannel.wakeup();
    }

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

impl<T> Waitable for SleepableLockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepableLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
