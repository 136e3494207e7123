//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: paths like /usr/src/kernel/fs.rs, for convenient naming.
//!
//! This module contains the low-level file system manipulation routines.
//! The (higher-level) system call implementations are in sysfile.rs.

use core::mem;

use spin::Once;

use crate::{
    bio::Buf,
    error::{KernelError, Result},
    kernel::kernel,
    lock::SleepableLock,
    param::BSIZE,
};

mod inode;
mod log;
mod path;
mod superblock;

pub use inode::{
    Dinode, Dirent, InodeGuard, InodeInner, InodeType, Itable, RcInode, DIRENT_SIZE, DIRSIZ,
};
pub use log::Log;
pub use path::{FileName, Path};
pub use superblock::{Superblock, BPB, IPB};

/// Root i-number.
pub const ROOTINO: u32 = 1;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 12;

/// Block addresses per indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Maximum file size in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// The file system: one superblock and one journal per (single) disk
/// device. Both are created on first use, from the initial process's
/// context, because reading them sleeps.
pub struct FileSystem {
    superblock: Once<Superblock>,
    log: Once<SleepableLock<Log>>,
}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            superblock: Once::new(),
            log: Once::new(),
        }
    }

    /// Read the superblock and recover the journal. Runs once; later calls
    /// are no-ops.
    pub fn init(&'static self, dev: u32) {
        if !self.superblock.is_completed() {
            let buf = kernel().disk().read(dev, 1);
            let superblock = self.superblock.call_once(|| Superblock::new(&buf));
            drop(buf);
            let _ = self.log.call_once(|| {
                SleepableLock::new(
                    "log",
                    Log::new(dev, superblock.logstart, superblock.nlog),
                )
            });
        }
    }

    pub fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("superblock")
    }

    fn log(&self) -> &SleepableLock<Log> {
        self.log.get().expect("log")
    }

    /// Begin a journal transaction. Every FS syscall brackets its disk
    /// mutations in one of these; dropping the `Tx` ends the operation and
    /// commits once the last outstanding one ends.
    pub fn begin_tx(&'static self) -> Tx {
        self.log().begin_op();
        Tx { fs: self }
    }
}

/// A handle on one open journal transaction.
pub struct Tx {
    fs: &'static FileSystem,
}

impl Drop for Tx {
    fn drop(&mut self) {
        // Commits if this was the last outstanding operation.
        self.fs.log().end_op();
    }
}

impl Tx {
    /// The caller has modified b.data and is done with the buffer: record
    /// the block in the journal in place of writing it home. The actual
    /// disk writes happen at commit.
    ///
    /// A typical use is:
    ///   let mut bp = kernel().disk().read(...);
    ///   modify bp.data_mut();
    ///   tx.write(bp);
    pub fn write(&self, b: Buf) {
        self.fs.log().lock().log_write(b);
    }

    /// Zero a block.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut buf = kernel().bcache().get(dev, bno);
        buf.data_mut().fill(0);
        buf.deref_inner_mut().valid = true;
        self.write(buf);
    }

    /// Allocate a zeroed data block. Fails when the bitmap is full.
    pub fn balloc(&self, dev: u32) -> Result<u32> {
        let sb = self.fs.superblock();
        for b in num_iter::range_step(0, sb.size, BPB) {
            let mut bp = kernel().disk().read(dev, sb.bblock(b));
            for bi in 0..core::cmp::min(BPB, sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    // The block is free.
                    bp.data_mut()[(bi / 8) as usize] |= m; // Mark in use.
                    self.write(bp);
                    self.bzero(dev, b + bi);
                    return Ok(b + bi);
                }
            }
            drop(bp);
        }

        Err(KernelError::OutOfBlocks)
    }

    /// Free a disk block.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock();
        let mut bp = kernel().disk().read(dev, sb.bblock(b));
        let bi = (b as usize) % (BPB as usize);
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data()[bi / 8] & m, 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        self.write(bp);
    }
}
