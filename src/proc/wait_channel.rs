use core::ptr;

use super::{current_proc, Procstate};
use crate::kernel::kernel;
use crate::lock::Waitable;

/// A sleep/wakeup rendezvous point. The channel's address is the token;
/// callers must pair `sleep` and `wakeup` on the same `WaitChannel`.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels could share an address, spuriously waking
    /// unrelated threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically releases the given lock and sleeps on this channel.
    /// Re-acquires the lock when awakened.
    pub fn sleep<G: Waitable>(&self, lk: &mut G) {
        let p = current_proc().expect("WaitChannel::sleep");

        // Must acquire p's lock in order to change p's state and then call
        // sched. Once we hold it, we are guaranteed not to miss any wakeup
        // (wakeup locks p's lock), so it's okay to release lk.
        let mut guard = p.lock();
        // SAFETY: paired with raw_acquire below; the data behind lk is not
        // accessed until then.
        unsafe { lk.raw_release() };

        // Go to sleep.
        guard.deref_mut_info().waitchannel = self as *const _;
        guard.deref_mut_info().state = Procstate::SLEEPING;
        // SAFETY: we hold p's lock, just changed its state, and interrupts
        // are disabled by the lock's push_off.
        unsafe { guard.sched() };

        // Tidy up.
        guard.deref_mut_info().waitchannel = ptr::null();
        drop(guard);

        // Re-acquire the original lock.
        // SAFETY: paired with raw_release above.
        unsafe { lk.raw_acquire() };
    }

    /// Wakes up all processes sleeping on this channel.
    /// Must be called without any process lock held.
    pub fn wakeup(&self) {
        kernel().procs().wakeup_pool(self);
    }
}
