//! Spin locks.

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::cpu::{self, Cpu};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock, for debugging.
    name: &'static str,

    /// If the lock is held, contains the pointer of the holding `Cpu`.
    /// Otherwise, contains null.
    locked: AtomicPtr<Cpu>,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicPtr::new(ptr::null_mut()),
            name,
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// The atomic exchange uses `Acquire` ordering, paired with the
    /// `Release` store in `release()`, so every store done in one critical
    /// section is visible to the loads of the next.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        unsafe { cpu::push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                cpu::current_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` since we don't enter the critical
                // section anyway if the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    /// Releases the lock with a `Release` store. See `acquire()`.
    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { cpu::pop_off() };
    }

    /// Checks whether this cpu is holding the lock.
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == cpu::current_raw()
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::new_with_raw(RawSpinlock::new(name), data)
    }
}
