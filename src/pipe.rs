//! Bounded in-memory byte FIFOs connecting a read end and a write end.

use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::{
    error::{KernelError, Result},
    file::{File, FileType, RcFile},
    kernel::kernel,
    lock::Spinlock,
    page::Page,
    proc::{CurrentProc, WaitChannel},
    riscv::PGSIZE,
    vm::{Addr, UVAddr},
};

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read. Monotone (wrapping); the ring index is
    /// nread % PIPESIZE.
    nread: u32,

    /// Number of bytes written. Monotone (wrapping).
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// Wait channel saying there are unread bytes in data.
    read_waitchannel: WaitChannel,

    /// Wait channel saying there is room to write in data.
    write_waitchannel: WaitChannel,
}

// A pipe and both of its file handles fit in the single page the pipe is
// allocated from.
const_assert!(mem::size_of::<Pipe>() <= PGSIZE);

/// What blocked a partial pipe transfer.
enum PipeError {
    /// The ring is full (writers) or empty (readers); sleep and retry.
    WaitForIo,
    /// The other end is gone or the process was killed; give up.
    InvalidStatus(KernelError),
    /// A user-memory copy failed after i bytes were transferred.
    InvalidCopy(usize),
}

impl Pipe {
    /// Read up to `n` bytes into the user address `addr`. Sleeps while the
    /// pipe is empty and the write end is open.
    pub fn read(&self, proc: &mut CurrentProc<'_>, addr: UVAddr, n: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(proc, addr, n) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                Err(PipeError::InvalidStatus(e)) => return Err(e),
                Err(PipeError::InvalidCopy(r)) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
            }
        }
    }

    /// Write `n` bytes from the user address `addr`. Wakes readers for
    /// every burst and sleeps whenever the ring fills.
    pub fn write(&self, proc: &mut CurrentProc<'_>, addr: UVAddr, n: usize) -> Result<usize> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(proc, addr.add(written), n - written) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < n {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(PipeError::InvalidCopy(r)) => {
                    self.read_waitchannel.wakeup();
                    return Ok(written + r);
                }
                Err(PipeError::InvalidStatus(e)) => return Err(e),
                Err(PipeError::WaitForIo) => unreachable!("Pipe::write"),
            }
        }
    }

    /// Close one end; returns true when both ends are now closed and the
    /// pipe should be freed.
    fn close(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();

        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }

        !inner.readopen && !inner.writeopen
    }
}

impl PipeInner {
    /// Write up to `n` bytes, stopping when the ring fills.
    fn try_write(
        &mut self,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> core::result::Result<usize, PipeError> {
        if !self.readopen {
            return Err(PipeError::InvalidStatus(KernelError::NotOpened));
        }
        if proc.killed() {
            return Err(PipeError::InvalidStatus(KernelError::ProcIsKilled));
        }
        let mut ch = [0u8];
        for i in 0..n {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // The ring is full; the caller wakes readers and sleeps.
                return Ok(i);
            }
            if proc
                .memory_mut()
                .copy_in_bytes(&mut ch, addr.add(i))
                .is_err()
            {
                return Err(PipeError::InvalidCopy(i));
            }
            self.data[self.nwrite as usize % PIPESIZE] = ch[0];
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    /// Read up to `n` bytes; empty-and-writer-open asks the caller to
    /// sleep.
    fn try_read(
        &mut self,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> core::result::Result<usize, PipeError> {
        if self.nread == self.nwrite && self.writeopen {
            if proc.killed() {
                return Err(PipeError::InvalidStatus(KernelError::ProcIsKilled));
            }
            return Err(PipeError::WaitForIo);
        }

        for i in 0..n {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            let ch = [self.data[self.nread as usize % PIPESIZE]];
            self.nread = self.nread.wrapping_add(1);
            if proc.memory_mut().copy_out_bytes(addr.add(i), &ch).is_err() {
                return Err(PipeError::InvalidCopy(i));
            }
        }
        Ok(n)
    }
}

/// An owning pointer to a `Pipe` living in a page from the allocator.
///
/// # Safety
///
/// `ptr` refers to a valid `Pipe` at the start of an allocator page. For
/// each pipe there is one read-only and one write-only open file; the
/// readopen/writeopen flags track them, so the page is freed only after
/// both have closed.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: the inner state is only reached through the pipe's spinlock.
unsafe impl Send for AllocatedPipe {}

impl Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr refers to a valid Pipe by the invariant.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Allocate a pipe and the two files for its ends: (read, write).
    pub fn alloc() -> Result<(RcFile, RcFile)> {
        let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;

        let ptr = page.as_mut_ptr() as *mut Pipe;
        // SAFETY: the page is exclusively ours, page-aligned, and large
        // enough (see the const_assert above).
        unsafe {
            ptr.write(Pipe {
                inner: Spinlock::new(
                    "pipe",
                    PipeInner {
                        data: [0; PIPESIZE],
                        nread: 0,
                        nwrite: 0,
                        readopen: true,
                        writeopen: true,
                    },
                ),
                read_waitchannel: WaitChannel::new(),
                write_waitchannel: WaitChannel::new(),
            });
        }
        // SAFETY: just written.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        // The page now lives behind the pipe; reclaimed in close.
        let page = scopeguard::guard(page, |page| kernel().free(page));

        let f0 = kernel()
            .ftable()
            .alloc(File::new(
                FileType::Pipe { pipe: AllocatedPipe { ptr } },
                true,
                false,
            ))
            .map_err(|_| KernelError::OutOfSlots)?;
        let f0 = scopeguard::guard(f0, |f0| f0.close());
        let f1 = kernel()
            .ftable()
            .alloc(File::new(
                FileType::Pipe { pipe: AllocatedPipe { ptr } },
                false,
                true,
            ))
            .map_err(|_| KernelError::OutOfSlots)?;

        // Both files exist; keep the page.
        mem::forget(scopeguard::ScopeGuard::into_inner(page));
        Ok((scopeguard::ScopeGuard::into_inner(f0), f1))
    }

    /// Close one end; when the pipe becomes fully closed, hand its page
    /// back for the caller to free.
    pub fn close(self, writable: bool) -> Option<Page> {
        if self.deref().close(writable) {
            // SAFETY: both ends are closed, so no other path to the pipe
            // exists, and ptr is the start of an allocator page by the
            // invariant.
            Some(unsafe { Page::from_usize(self.ptr.as_ptr() as usize) })
        } else {
            None
        }
    }
}
