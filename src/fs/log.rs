//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call should bracket its start and end with `begin_op`/`end_op`
//! (here, by holding a `Tx`). Usually begin_op just increments the count of
//! in-progress FS system calls and returns. But if it thinks the log is
//! close to running out, it sleeps until the last outstanding end_op
//! commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;

use crate::{
    bio::BufData,
    kernel::kernel,
    lock::SleepableLock,
    param::{BSIZE, LOGSIZE, MAXOPBLOCKS},
};

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS syscalls are executing?
    outstanding: usize,

    /// In commit(); please wait.
    committing: bool,

    /// In-memory copy of the header block: the numbers of the blocks this
    /// transaction has logged so far. Each is pinned in the buffer cache
    /// until commit.
    header: ArrayVec<u32, LOGSIZE>,
}

/// Contents of the on-disk header block.
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);
const_assert!(mem::align_of::<BufData>() % mem::align_of::<LogHeader>() == 0);

impl Log {
    /// Set up the journal for `dev` and run crash recovery.
    pub fn new(dev: u32, start: u32, size: u32) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            header: ArrayVec::new(),
        };
        log.recover_from_log();
        log
    }

    /// Read the log header from disk into the in-memory header.
    fn read_head(&mut self) {
        let buf = kernel().disk().read(self.dev, self.start);
        // SAFETY: buf.data is larger than LogHeader, properly aligned, and
        // u32s have no invalid representations; the buffer is locked.
        let lh = unsafe { &*(buf.data().as_ptr() as *const LogHeader) };
        self.header.clear();
        for b in &lh.block[..lh.n as usize] {
            self.header.push(*b);
        }
    }

    /// Write the in-memory header to disk. This is the true point at which
    /// the current transaction commits.
    fn write_head(&mut self) {
        let mut buf = kernel().disk().read(self.dev, self.start);
        // SAFETY: as in read_head, and the buffer is locked.
        let lh = unsafe { &mut *(buf.data_mut().as_mut_ptr() as *mut LogHeader) };
        lh.n = self.header.len() as u32;
        for (db, b) in lh.block.iter_mut().zip(&self.header) {
            *db = *b;
        }
        kernel().disk().write(&mut buf);
    }

    /// Copy committed blocks from the log to their home locations.
    fn install_trans(&mut self, recovering: bool) {
        for (tail, blockno) in self.header.iter().enumerate() {
            // Read the log block.
            let lbuf = kernel().disk().read(self.dev, self.start + tail as u32 + 1);

            // Read the destination.
            let mut dbuf = kernel().disk().read(self.dev, *blockno);

            // Copy the block to its destination and write it home.
            dbuf.data_mut().copy_from(lbuf.data());
            kernel().disk().write(&mut dbuf);

            if !recovering {
                kernel().bcache().unpin(&dbuf);
            }

            drop(lbuf);
            drop(dbuf);
        }
    }

    fn recover_from_log(&mut self) {
        self.read_head();

        // If the header names committed blocks, copy them from the log to
        // their homes.
        self.install_trans(true);

        // Clear the log.
        self.header.clear();
        self.write_head();
    }

    /// Copy modified blocks from the cache to the log.
    fn write_log(&mut self) {
        for (tail, blockno) in self.header.iter().enumerate() {
            // The log slot.
            let mut to = kernel().disk().read(self.dev, self.start + tail as u32 + 1);

            // The cached home block.
            let from = kernel().disk().read(self.dev, *blockno);

            to.data_mut().copy_from(from.data());

            // Write the log.
            kernel().disk().write(&mut to);

            drop(to);
            drop(from);
        }
    }

    fn commit(&mut self) {
        if !self.header.is_empty() {
            // Write modified blocks from the cache to the log.
            self.write_log();

            // Write the header to disk: the real commit.
            self.write_head();

            // Now install the writes to their home locations.
            self.install_trans(false);

            // Erase the transaction from the log.
            self.header.clear();
            self.write_head();
        }
    }

    /// The caller has modified the buffer and is done with it. Record its
    /// block number and pin it in the cache until commit.
    pub fn log_write(&mut self, b: crate::bio::Buf) {
        assert!(
            self.header.len() < LOGSIZE && (self.header.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log_write outside of trans");

        // Log absorption: a block updated twice in one transaction keeps
        // its single log slot.
        if !self.header.contains(&b.blockno) {
            kernel().bcache().pin(&b);
            self.header.push(b.blockno);
        }
    }
}

impl SleepableLock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.header.len() + (guard.outstanding + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self) {
        let mut guard = self.lock();
        assert!(guard.outstanding >= 1, "end_op");
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: committing");

        if guard.outstanding == 0 {
            // No transaction is ongoing, and holding the lock keeps new
            // ones from starting.
            guard.committing = true;
            // With committing set, new transactions stay out even after
            // the lock is released; commit without it, since commit sleeps
            // on disk I/O.
            guard.reacquire_after(||
                // SAFETY: committing is set, so nothing else reads or
                // writes the log state.
                unsafe { &mut *self.get_mut_raw() }.commit());
            guard.committing = false;
        }

        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        guard.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_in_one_block() {
        assert!(mem::size_of::<LogHeader>() <= BSIZE);
    }

    #[test]
    fn admission_bound_reserves_room_for_every_op() {
        // With nothing logged, LOGSIZE / MAXOPBLOCKS ops may run at once.
        let mut outstanding = 0;
        while (outstanding + 1) * MAXOPBLOCKS <= LOGSIZE {
            outstanding += 1;
        }
        assert_eq!(outstanding, LOGSIZE / MAXOPBLOCKS);
        // One more would overflow the on-disk log in the worst case.
        assert!((outstanding + 1) * MAXOPBLOCKS > LOGSIZE);
    }
}
