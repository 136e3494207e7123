//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also provides
//! a synchronization point for disk blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `Disk::read`.
//! * After changing buffer data, call `Disk::write` to write it to disk.
//! * A `Buf` returns itself to the cache when dropped.
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.
//!
//! The control plane (identity, reference counts, recency order) lives in a
//! spin-locked, index-linked LRU list over a fixed array; the payload of
//! each slot sits behind its own sleep-lock.

use core::sync::atomic::AtomicBool;

use array_macro::array;

use crate::{
    kernel::kernel,
    lock::{SleepLock, Spinlock},
    param::{BSIZE, NBUF},
    proc::WaitChannel,
};

/// Block data, aligned so that on-disk records (whose fields are u32s and
/// u64s) can be read in place.
#[repr(align(8))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl core::ops::Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl core::ops::DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl BufData {
    pub fn copy_from(&mut self, other: &BufData) {
        self.inner.copy_from_slice(&other.inner);
    }
}

/// The sleep-locked part of a cache slot.
pub struct BufInner {
    /// Has data been read from disk?
    pub valid: bool,

    pub data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            data: BufData { inner: [0; BSIZE] },
        }
    }
}

/// One cache slot.
pub struct BufEntry {
    pub inner: SleepLock<BufInner>,

    /// Does the disk own the buffer? Set by the requesting process before
    /// it notifies the device, cleared by the completion interrupt. Lives
    /// outside the sleep lock because the interrupt handler has no way to
    /// take it.
    pub owned_by_disk: AtomicBool,

    /// Wait channel saying the disk request is done.
    pub disk_waitchannel: WaitChannel,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            inner: SleepLock::new("buffer", BufInner::new()),
            owned_by_disk: AtomicBool::new(false),
            disk_waitchannel: WaitChannel::new(),
        }
    }
}

/// Identity and recency of one slot; protected by the cache's spinlock.
#[derive(Copy, Clone)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

/// The LRU list: an index-based doubly linked, circular list over the slot
/// array. `head` is the most recently used slot; `meta[head].prev` the
/// least.
///
/// Invariants: the list always contains every slot exactly once; no two
/// slots with nonzero refcnt share a (dev, blockno).
struct LruList {
    meta: [BufMeta; NBUF],
    head: usize,
}

impl LruList {
    const fn new() -> Self {
        let mut meta = [BufMeta {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: 0,
            next: 0,
        }; NBUF];
        let mut i = 0;
        while i < NBUF {
            meta[i].prev = (i + NBUF - 1) % NBUF;
            meta[i].next = (i + 1) % NBUF;
            i += 1;
        }
        Self { meta, head: 0 }
    }

    fn unlink(&mut self, i: usize) {
        let prev = self.meta[i].prev;
        let next = self.meta[i].next;
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
        if self.head == i {
            self.head = next;
        }
    }

    fn push_front(&mut self, i: usize) {
        let head = self.head;
        let tail = self.meta[head].prev;
        self.meta[i].next = head;
        self.meta[i].prev = tail;
        self.meta[head].prev = i;
        self.meta[tail].next = i;
        self.head = i;
    }

    /// Look for block (dev, blockno). On a hit, bump the refcnt. On a miss,
    /// recycle the least recently used slot with refcnt 0; the second
    /// element of the result is true iff the slot was recycled and its
    /// contents must be reloaded. `None` if every slot is in use.
    fn find_or_recycle(&mut self, dev: u32, blockno: u32) -> Option<(usize, bool)> {
        // Is the block already cached?
        let mut i = self.head;
        for _ in 0..NBUF {
            let m = &mut self.meta[i];
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                return Some((i, false));
            }
            i = m.next;
        }

        // Not cached. Recycle the least recently used unused slot.
        let mut i = self.meta[self.head].prev;
        for _ in 0..NBUF {
            let m = &mut self.meta[i];
            if m.refcnt == 0 {
                m.dev = dev;
                m.blockno = blockno;
                m.refcnt = 1;
                return Some((i, true));
            }
            i = m.prev;
        }

        None
    }

    /// Drop one reference; at zero the slot becomes the most recently used.
    fn release(&mut self, i: usize) {
        let m = &mut self.meta[i];
        assert!(m.refcnt > 0, "LruList::release");
        m.refcnt -= 1;
        if m.refcnt == 0 && self.head != i {
            self.unlink(i);
            self.push_front(i);
        }
    }

    fn pin(&mut self, i: usize) {
        self.meta[i].refcnt += 1;
    }

    fn unpin(&mut self, i: usize) {
        assert!(self.meta[i].refcnt > 0, "LruList::unpin");
        self.meta[i].refcnt -= 1;
    }
}

pub struct Bcache {
    lru: Spinlock<LruList>,
    entries: [BufEntry; NBUF],
}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            lru: Spinlock::new("bcache", LruList::new()),
            entries: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Return a sleep-locked buffer for block (dev, blockno). Does not read
    /// from the disk; the caller checks `valid`.
    pub fn get(&'static self, dev: u32, blockno: u32) -> Buf {
        let (idx, recycled) = self
            .lru
            .lock()
            .find_or_recycle(dev, blockno)
            .expect("Bcache::get: no buffers");

        if recycled {
            // SAFETY: refcnt was 0, so no one holds the slot's sleep lock
            // or is waiting on it under the old identity, and the disk does
            // not own it.
            unsafe { (*self.entries[idx].inner.get_mut_raw()).valid = false };
        }

        // The sleep lock is taken outside the LRU lock: it may block.
        core::mem::forget(self.entries[idx].inner.lock());
        Buf { idx, dev, blockno }
    }

    /// Bump the refcnt so the slot survives eviction until `unpin`; used by
    /// the journal to keep dirty blocks cached until commit.
    pub fn pin(&self, buf: &Buf) {
        self.lru.lock().pin(buf.idx);
    }

    pub fn unpin(&self, buf: &Buf) {
        self.lru.lock().unpin(buf.idx);
    }

    pub(crate) fn entry(&self, idx: usize) -> &BufEntry {
        &self.entries[idx]
    }
}

/// A sleep-locked cache slot. Dropping it unlocks the slot and returns it
/// to the cache's recency order.
///
/// # Safety
///
/// `entries[idx].inner` is locked by the holder, and the slot's refcnt
/// accounts for this handle.
pub struct Buf {
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
}

impl Buf {
    pub(crate) fn cache_idx(&self) -> usize {
        self.idx
    }

    pub(crate) fn entry(&self) -> &'static BufEntry {
        kernel().bcache().entry(self.idx)
    }

    pub fn deref_inner(&self) -> &BufInner {
        // SAFETY: the sleep lock is held.
        unsafe { &*self.entry().inner.get_mut_raw() }
    }

    pub fn deref_inner_mut(&mut self) -> &mut BufInner {
        // SAFETY: the sleep lock is held and &mut self is exclusive.
        unsafe { &mut *self.entry().inner.get_mut_raw() }
    }

    pub fn data(&self) -> &BufData {
        &self.deref_inner().data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.deref_inner_mut().data
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        let entry = self.entry();
        // SAFETY: the guard of this sleep lock was forgotten in
        // Bcache::get, so the lock is held and releasing it here is
        // balanced.
        unsafe { entry.inner.unlock() };
        kernel().bcache().lru.lock().release(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_bumps_refcnt_and_keeps_identity() {
        let mut lru = LruList::new();
        let (a, fresh) = lru.find_or_recycle(1, 17).unwrap();
        assert!(fresh);
        let (b, fresh) = lru.find_or_recycle(1, 17).unwrap();
        assert!(!fresh);
        assert_eq!(a, b);
        assert_eq!(lru.meta[a].refcnt, 2);
    }

    #[test]
    fn release_moves_free_slot_to_mru_head() {
        let mut lru = LruList::new();
        let (a, _) = lru.find_or_recycle(1, 1).unwrap();
        lru.release(a);
        assert_eq!(lru.head, a);
        // The slot keeps its identity and is found again without a reload.
        let (b, fresh) = lru.find_or_recycle(1, 1).unwrap();
        assert_eq!(a, b);
        assert!(!fresh);
    }

    #[test]
    fn recycle_prefers_least_recently_used() {
        let mut lru = LruList::new();
        // Touch every slot once so each has a distinct identity.
        let mut order = [0; NBUF];
        for (i, slot) in order.iter_mut().enumerate() {
            let (idx, fresh) = lru.find_or_recycle(1, i as u32 + 100).unwrap();
            assert!(fresh);
            *slot = idx;
            lru.release(idx);
        }
        // All free; a new block must take the least recently released,
        // i.e. the first one touched.
        let (idx, fresh) = lru.find_or_recycle(1, 9999).unwrap();
        assert!(fresh);
        assert_eq!(idx, order[0]);
    }

    #[test]
    fn busy_slots_are_not_recycled() {
        let mut lru = LruList::new();
        // Hold a reference on every slot.
        for i in 0..NBUF {
            let (_, fresh) = lru.find_or_recycle(1, i as u32 + 100).unwrap();
            assert!(fresh);
        }
        assert!(lru.find_or_recycle(1, 9999).is_none());
    }

    #[test]
    fn pin_keeps_slot_from_recycling() {
        let mut lru = LruList::new();
        let (a, _) = lru.find_or_recycle(1, 7).unwrap();
        lru.pin(a);
        lru.release(a);
        // Fill the rest of the cache and release everything else.
        for i in 0..NBUF - 1 {
            let (idx, _) = lru.find_or_recycle(1, i as u32 + 100).unwrap();
            lru.release(idx);
        }
        // Every new identity must avoid the pinned slot.
        for i in 0..NBUF - 1 {
            let (idx, _) = lru.find_or_recycle(1, i as u32 + 200).unwrap();
            assert_ne!(idx, a);
        }
        lru.unpin(a);
        assert_eq!(lru.meta[a].refcnt, 0);
    }
}
