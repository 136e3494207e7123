//! Sleeping locks: long-term locks for processes.

use super::{Guard, Lock, RawLock, SleepableLock};
use crate::proc;

/// A mutex that yields the CPU instead of busy waiting.
pub struct RawSleepLock {
    /// PID of the process holding the lock. `-1` means unlocked.
    locked: SleepableLock<i32>,

    /// Name of lock, for debugging.
    name: &'static str,
}

/// Locks that sleep instead of busy waiting.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: SleepableLock::new("sleep lock", -1),
            name,
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = proc::current_proc().expect("RawSleepLock::acquire").pid();
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = -1;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        let guard = self.locked.lock();
        match proc::current_proc() {
            Some(p) => *guard == p.pid(),
            None => false,
        }
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::new_with_raw(RawSleepLock::new(name), data)
    }
}
