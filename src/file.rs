//! Support for file descriptors: the global file table and the `File`
//! union of pipes, inodes and devices.

use core::cell::UnsafeCell;
use core::cmp;
use core::mem;

use array_macro::array;

use crate::{
    error::{KernelError, Result},
    fs::RcInode,
    kernel::kernel,
    lock::Spinlock,
    param::{BSIZE, MAXOPBLOCKS, NFILE},
    pipe::AllocatedPipe,
    proc::CurrentProc,
    vm::{Addr, UVAddr},
};

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        /// The read/write offset, shared by every duplicate of this open
        /// file. Advanced together with the transfer, under the inode's
        /// sleep-lock.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode,
        major: u16,
    },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }
}

/// Map of major device number to device read/write functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(UVAddr, usize) -> Result<usize>>,
    pub write: Option<fn(UVAddr, usize) -> Result<usize>>,
}

/// The global file table. Reference counts live under the table's
/// spinlock; a `File` itself is written only while its slot goes from free
/// to used (or back), when the writer holds the only path to it.
pub struct FTable {
    refcnt: Spinlock<[u32; NFILE]>,
    files: [UnsafeCell<File>; NFILE],
}

// SAFETY: a File is only written by alloc/close when its refcnt says no
// handle exists; shared access through RcFile is read-only (the interior
// offset cell is serialized by the inode sleep-lock).
unsafe impl Sync for FTable {}

/// A reference-counted handle to an open file. `dup` to share, `close` to
/// drop; the backing resource is released when the last handle closes.
pub struct RcFile {
    idx: usize,
}

impl FTable {
    pub const fn new() -> Self {
        Self {
            refcnt: Spinlock::new("ftable", [0; NFILE]),
            files: array![_ => UnsafeCell::new(File::new(FileType::None, false, false)); NFILE],
        }
    }

    /// Allocate a file structure. When the table is full the file comes
    /// back as the error, so the caller can release whatever it carries.
    pub fn alloc(&self, file: File) -> core::result::Result<RcFile, File> {
        let mut refcnt = self.refcnt.lock();
        for (i, r) in refcnt.iter_mut().enumerate() {
            if *r == 0 {
                *r = 1;
                // SAFETY: refcnt was 0, so no handle to this slot exists,
                // and new ones appear only under the lock we hold.
                unsafe { *self.files[i].get() = file };
                return Ok(RcFile { idx: i });
            }
        }
        Err(file)
    }
}

impl core::ops::Deref for RcFile {
    type Target = File;

    fn deref(&self) -> &File {
        // SAFETY: while this handle exists the slot's refcnt is nonzero,
        // so the File is initialized and not rewritten.
        unsafe { &*kernel().ftable().files[self.idx].get() }
    }
}

impl RcFile {
    /// Increment the reference count for the open file.
    pub fn dup(&self) -> RcFile {
        kernel().ftable().refcnt.lock()[self.idx] += 1;
        RcFile { idx: self.idx }
    }

    /// Close the file: decrement the reference count, releasing the
    /// backing resource when it reaches zero.
    pub fn close(self) {
        let ftable = kernel().ftable();
        let mut refcnt = ftable.refcnt.lock();
        assert!(refcnt[self.idx] >= 1, "RcFile::close");
        refcnt[self.idx] -= 1;
        if refcnt[self.idx] > 0 {
            return;
        }

        // Last reference: take the file out of the slot and release what
        // it held. The slot stays claimed (refcnt is only re-examined
        // under the lock, which we drop before sleeping).
        refcnt[self.idx] = 1;
        // SAFETY: refcnt was 1, so this handle is the only path to the
        // slot.
        let file = unsafe {
            mem::replace(
                &mut *ftable.files[self.idx].get(),
                File::new(FileType::None, false, false),
            )
        };
        drop(refcnt);

        let File { typ, writable, .. } = file;
        match typ {
            FileType::Pipe { pipe } => {
                if let Some(page) = pipe.close(writable) {
                    kernel().free(page);
                }
            }
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                // The put may free disk blocks, so it needs a transaction.
                let tx = kernel().fs().begin_tx();
                ip.put(&tx);
                drop(tx);
            }
            FileType::None => (),
        }

        kernel().ftable().refcnt.lock()[self.idx] = 0;
    }

    /// Get metadata about the file and copy it out to the user address
    /// `addr`.
    pub fn stat(&self, proc: &mut CurrentProc<'_>, addr: UVAddr) -> Result<()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let st = ip.stat();
                proc.memory_mut().copy_out(addr, &st)
            }
            _ => Err(KernelError::BadFd),
        }
    }

    /// Read from the file into the user address `addr`.
    pub fn read(&self, proc: &mut CurrentProc<'_>, addr: UVAddr, n: usize) -> Result<usize> {
        if !self.readable {
            return Err(KernelError::PermissionDenied);
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(proc, addr, n),
            FileType::Inode { ip, off } => {
                let mut ip = ip.lock();
                // SAFETY: the offset cell is only touched under the
                // inode's sleep-lock, which we hold.
                let cur = unsafe { *off.get() };
                let r = ip.read_user(proc, addr, cur, n as u32);
                if let Ok(r) = r {
                    // SAFETY: as above.
                    unsafe { *off.get() = cur.wrapping_add(r as u32) };
                }
                drop(ip);
                r
            }
            FileType::Device { major, .. } => {
                let read = kernel()
                    .devsw(*major as usize)
                    .and_then(|dev| dev.read)
                    .ok_or(KernelError::BadFd)?;
                read(addr, n)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write to the file from the user address `addr`.
    pub fn write(&self, proc: &mut CurrentProc<'_>, addr: UVAddr, n: usize) -> Result<usize> {
        if !self.writable {
            return Err(KernelError::PermissionDenied);
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(proc, addr, n),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including the inode, the
                // indirect block, allocation blocks, and two blocks of
                // slop for non-aligned writes. This really belongs lower
                // down, since write() might be writing a device like the
                // console.
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let mut written = 0;
                while written < n {
                    let n1 = cmp::min(n - written, max);
                    let tx = kernel().fs().begin_tx();
                    let mut guard = ip.lock();
                    // SAFETY: the offset cell is only touched under the
                    // inode's sleep-lock, which we hold.
                    let cur = unsafe { *off.get() };
                    let r = guard.write_user(proc, addr.add(written), cur, n1 as u32, &tx);
                    if let Ok(r) = r {
                        // SAFETY: as above.
                        unsafe { *off.get() = cur.wrapping_add(r as u32) };
                    }
                    drop(guard);
                    drop(tx);

                    match r {
                        Ok(r) if r == n1 => written += r,
                        // A short or failed transfer; the error was with
                        // this chunk.
                        Ok(_) => return Err(KernelError::BMapFailed),
                        Err(e) => return Err(e),
                    }
                }
                Ok(n)
            }
            FileType::Device { major, .. } => {
                let write = kernel()
                    .devsw(*major as usize)
                    .and_then(|dev| dev.write)
                    .ok_or(KernelError::BadFd)?;
                write(addr, n)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Allocate a file descriptor in the current process for this file.
    /// Takes over the handle; on failure it is closed.
    pub fn fdalloc(self, proc: &mut CurrentProc<'_>) -> Result<usize> {
        let files = &mut proc.deref_mut_data().open_files;
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(self);
                return Ok(fd);
            }
        }
        self.close();
        Err(KernelError::BadFd)
    }
}
