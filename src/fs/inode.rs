//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links referring
//! to it, and the list of blocks holding the file's content.
//!
//! The inodes are laid out sequentially on disk at superblock.inodestart.
//! Each inode has a number, indicating its position on the disk.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. The
//! in-memory inodes include book-keeping information that is not stored on
//! disk: the reference count and the valid flag.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file system code.
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   `Itable::alloc_inode` allocates, and `RcInode::put` frees if the
//!   reference and link counts have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if its
//!   refcnt is zero. Otherwise the refcnt tracks the number of in-memory
//!   handles to the entry (open files and current directories).
//!   `Itable::get` finds or creates a table entry and increments its ref;
//!   `RcInode::put` decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only
//!   correct when `valid` is true. `RcInode::lock` reads the inode from
//!   the disk and sets `valid`, while `RcInode::put` clears `valid` if the
//!   refcnt has fallen to zero.
//!
//! * Locked: file system code may only examine and modify the information
//!   in an inode and its content if it has first locked the inode.
//!
//! Thus a typical sequence is:
//!   let ip = itable.get(dev, inum);
//!   let guard = ip.lock();
//!   ... examine and modify the guard's fields ...
//!   drop(guard);
//!   ip.put(&tx);
//!
//! Locking is separate from `get` so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g. in read). The separation also helps avoid
//! deadlock and races during pathname lookup; `get` increments the refcnt
//! so that the inode stays in the table and the handle remains valid.
//!
//! The table's spin-lock protects the allocation of entries: refcnt, dev
//! and inum. An entry's sleep-lock protects all the other fields.

use core::mem;

use array_macro::array;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::{FileName, Path, Tx, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO};
use crate::{
    error::{KernelError, Result},
    kernel::kernel,
    lock::{SleepLock, SleepLockGuard, Spinlock},
    param::{BSIZE, NINODE, ROOTDEV},
    proc::{current_proc, CurrentProc},
    stat::Stat,
    vm::{Addr, UVAddr},
};

/// Directory entries hold names of up to DIRSIZ - 1 bytes, NUL-padded.
pub const DIRSIZ: usize = 14;

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// On-disk inode type tags.
const T_NONE: i16 = 0;
const T_DIR: i16 = 1;
const T_FILE: i16 = 2;
const T_DEVICE: i16 = 3;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// On-disk inode structure. mkfs writes these; both must agree on the
/// layout.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; T_NONE marks a free inode.
    typ: i16,

    /// Major device number (T_DEVICE only).
    major: i16,

    /// Minor device number (T_DEVICE only).
    minor: i16,

    /// Number of links to the inode in the file system.
    nlink: i16,

    /// Size of file (bytes).
    size: u32,

    /// Direct data block addresses.
    addr_direct: [u32; NDIRECT],

    /// Indirect data block address.
    addr_indirect: u32,
}

/// A directory is a file containing a sequence of Dirent structures.
#[repr(C)]
#[derive(Default, AsBytes, FromBytes)]
pub struct Dirent {
    /// Inode number; 0 marks a free entry.
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    /// Fill in the name, NUL-padded to DIRSIZ.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        self.name[..name.len()].copy_from_slice(name);
        for byte in &mut self.name[name.len()..] {
            *byte = 0;
        }
    }

    /// The slice that exactly contains the name; no NUL characters.
    fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ - 1);
        // SAFETY: self.name[..len] contains no NUL, and len <= DIRSIZ - 1.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// The sleep-locked part of an in-memory inode: a cached copy of the disk
/// inode plus the valid flag.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub valid: bool,

    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub addr_direct: [u32; NDIRECT],
    pub addr_indirect: u32,
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addr_direct: [0; NDIRECT],
            addr_indirect: 0,
        }
    }
}

/// Identity of a table entry; protected by the table's spinlock.
#[derive(Copy, Clone)]
struct IMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// The in-memory inode table.
pub struct Itable {
    meta: Spinlock<[IMeta; NINODE]>,
    inodes: [SleepLock<InodeInner>; NINODE],
}

/// A reference-counted handle to an in-memory inode. Obtained from
/// `Itable::get`; must be returned with `RcInode::put` (inside a journal
/// transaction, because the drop of the last reference may free disk
/// blocks) or passed on. Does not keep the inode locked.
pub struct RcInode {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// A locked in-memory inode, contents loaded and valid.
pub struct InodeGuard<'a> {
    pub dev: u32,
    pub inum: u32,
    guard: SleepLockGuard<'a, InodeInner>,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            meta: Spinlock::new(
                "itable",
                [IMeta {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; NINODE],
            ),
            inodes: array![_ => SleepLock::new("inode", InodeInner::new()); NINODE],
        }
    }

    /// Find the inode with number `inum` on device `dev` and return its
    /// in-memory handle. Does not lock the inode and does not read it from
    /// disk.
    pub fn get(&self, dev: u32, inum: u32) -> RcInode {
        let mut meta = self.meta.lock();

        // Is the inode already in the table?
        let mut empty = None;
        for (i, m) in meta.iter_mut().enumerate() {
            if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                m.refcnt += 1;
                return RcInode { idx: i, dev, inum };
            }
            if empty.is_none() && m.refcnt == 0 {
                empty = Some(i);
            }
        }

        // Recycle an unused entry.
        let i = empty.expect("Itable::get: no inodes");
        let m = &mut meta[i];
        m.dev = dev;
        m.inum = inum;
        m.refcnt = 1;
        // SAFETY: refcnt was 0, so nothing references or locks the entry.
        unsafe { (*self.inodes[i].get_mut_raw()).valid = false };
        RcInode { idx: i, dev, inum }
    }

    pub fn root(&self) -> RcInode {
        self.get(ROOTDEV, ROOTINO)
    }

    /// Allocate an inode on device `dev`, marked allocated on disk by
    /// giving it the type. Returns an unlocked but referenced inode.
    pub fn alloc_inode(&self, dev: u32, typ: InodeType, tx: &Tx) -> Result<RcInode> {
        let sb = kernel().fs().superblock();
        for inum in 1..sb.ninodes {
            let mut bp = kernel().disk().read(dev, sb.iblock(inum));
            let off = (inum as usize % IPB) * mem::size_of::<Dinode>();
            let (mut dip, _) =
                LayoutVerified::<&mut [u8], Dinode>::new_from_prefix(&mut bp.data_mut()[off..])
                    .expect("alloc_inode: dinode");

            if dip.typ == T_NONE {
                // A free inode: claim it.
                *dip = Dinode::from_parts(typ, 0, 0);
                // Mark it allocated on the disk.
                tx.write(bp);
                return Ok(self.get(dev, inum));
            }
            drop(bp);
        }
        Err(KernelError::OutOfSlots)
    }

    /// Look up a path and return its inode. Must be called inside a
    /// transaction since it calls `RcInode::put`.
    pub fn namei(&self, path: &Path, tx: &Tx) -> Result<RcInode> {
        Ok(self.namex(path, false, tx)?.0)
    }

    /// Look up the parent directory of a path, and also return the final
    /// path element.
    pub fn nameiparent<'p>(&self, path: &'p Path, tx: &Tx) -> Result<(RcInode, &'p FileName)> {
        let (ip, name) = self.namex(path, true, tx)?;
        let name = name.ok_or(KernelError::LookupFailed)?;
        Ok((ip, name))
    }

    fn namex<'p>(
        &self,
        mut path: &'p Path,
        parent: bool,
        tx: &Tx,
    ) -> Result<(RcInode, Option<&'p FileName>)> {
        let mut ptr = if path.is_absolute() {
            self.root()
        } else {
            current_proc().expect("namex").cwd().dup()
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut ip = ptr.lock();
            if ip.typ != InodeType::Dir {
                drop(ip);
                ptr.put(tx);
                return Err(KernelError::LookupFailed);
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let next = ip.dirlookup(name);
            drop(ip);
            ptr.put(tx);
            ptr = next?.0;
        }

        if parent {
            ptr.put(tx);
            return Err(KernelError::LookupFailed);
        }
        Ok((ptr, None))
    }
}

impl RcInode {
    /// Increment the reference count; the returned handle is
    /// interchangeable with this one.
    pub fn dup(&self) -> RcInode {
        let itable = kernel().itable();
        itable.meta.lock()[self.idx].refcnt += 1;
        RcInode {
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference, the table entry can be recycled. If, additionally, the
    /// inode has no links to it, free the inode (and its content) on disk.
    /// Must be called inside a transaction for that reason.
    pub fn put(self, tx: &Tx) {
        let itable = kernel().itable();
        let mut meta = itable.meta.lock();

        if meta[self.idx].refcnt == 1 {
            // refcnt == 1 means no other handle exists, so no one else can
            // hold or take the sleep-lock: reading the cached fields does
            // not race, and the lock() below cannot block.
            // SAFETY: see above.
            let inner = unsafe { &*itable.inodes[self.idx].get_mut_raw() };
            if inner.valid && inner.nlink == 0 {
                // The inode has no links and no other references: truncate
                // and free it on disk.
                drop(meta);

                let mut ip = self.lock();
                ip.itrunc(tx);
                ip.typ = InodeType::None;
                ip.update(tx);
                ip.valid = false;
                drop(ip);

                meta = itable.meta.lock();
            }
        }

        meta[self.idx].refcnt -= 1;
    }

    /// Lock the inode, reading it from disk if necessary. The guard stands
    /// alone (the table is static); the caller keeps the `RcInode` alive
    /// for as long as the guard is used.
    pub fn lock(&self) -> InodeGuard<'static> {
        let itable = kernel().itable();
        let mut guard = itable.inodes[self.idx].lock();
        if !guard.valid {
            let bp = kernel()
                .disk()
                .read(self.dev, kernel().fs().superblock().iblock(self.inum));
            let off = (self.inum as usize % IPB) * mem::size_of::<Dinode>();
            let (dip, _) = LayoutVerified::<&[u8], Dinode>::new_from_prefix(&bp.data()[off..])
                .expect("Inode::lock: dinode");

            guard.typ = dip.typ();
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addr_direct.copy_from_slice(&dip.addr_direct);
            guard.addr_indirect = dip.addr_indirect;
            drop(bp);
            guard.valid = true;
            assert_ne!(guard.typ, InodeType::None, "Inode::lock: no type");
        }
        InodeGuard {
            dev: self.dev,
            inum: self.inum,
            guard,
        }
    }

    /// Stat information for the inode.
    pub fn stat(&self) -> Stat {
        let guard = self.lock();
        Stat {
            dev: guard.dev as i32,
            ino: guard.inum,
            typ: match guard.typ {
                InodeType::None => 0,
                InodeType::Dir => 1,
                InodeType::File => 2,
                InodeType::Device { .. } => 3,
            },
            nlink: guard.nlink,
            _padding: 0,
            size: guard.size as u64,
        }
    }
}

impl Dinode {
    fn typ(&self) -> InodeType {
        match self.typ {
            T_DIR => InodeType::Dir,
            T_FILE => InodeType::File,
            T_DEVICE => InodeType::Device {
                major: self.major as u16,
                minor: self.minor as u16,
            },
            _ => InodeType::None,
        }
    }

    fn from_parts(typ: InodeType, nlink: i16, size: u32) -> Self {
        let (t, major, minor) = match typ {
            InodeType::None => (T_NONE, 0, 0),
            InodeType::Dir => (T_DIR, 0, 0),
            InodeType::File => (T_FILE, 0, 0),
            InodeType::Device { major, minor } => (T_DEVICE, major as i16, minor as i16),
        };
        Self {
            typ: t,
            major,
            minor,
            nlink,
            size,
            addr_direct: [0; NDIRECT],
            addr_indirect: 0,
        }
    }
}

impl InodeGuard<'_> {
    /// Copy a modified in-memory inode to disk. Must be called (inside a
    /// transaction) after every change to a field that lives on disk.
    pub fn update(&self, tx: &Tx) {
        let mut bp = kernel()
            .disk()
            .read(self.dev, kernel().fs().superblock().iblock(self.inum));
        let off = (self.inum as usize % IPB) * mem::size_of::<Dinode>();
        let (mut dip, _) =
            LayoutVerified::<&mut [u8], Dinode>::new_from_prefix(&mut bp.data_mut()[off..])
                .expect("InodeGuard::update: dinode");

        let mut dinode = Dinode::from_parts(self.typ, self.nlink, self.size);
        dinode.addr_direct.copy_from_slice(&self.addr_direct);
        dinode.addr_indirect = self.addr_indirect;
        *dip = dinode;

        tx.write(bp);
    }

    /// Truncate the inode: discard its contents. Frees each data block the
    /// indirect block names, then the indirect block itself, then the
    /// direct blocks.
    pub fn itrunc(&mut self, tx: &Tx) {
        let dev = self.dev;
        for addr in &mut self.guard.addr_direct {
            if *addr != 0 {
                tx.bfree(dev, *addr);
                *addr = 0;
            }
        }

        if self.addr_indirect != 0 {
            let mut bp = kernel().disk().read(dev, self.addr_indirect);
            // SAFETY: u32 has no internal structure.
            let (prefix, addrs, _) = unsafe { bp.data_mut().align_to_mut::<u32>() };
            debug_assert_eq!(prefix.len(), 0, "itrunc: buf data unaligned");
            for a in addrs.iter() {
                if *a != 0 {
                    tx.bfree(dev, *a);
                }
            }
            drop(bp);
            tx.bfree(dev, self.addr_indirect);
            self.addr_indirect = 0;
        }

        self.size = 0;
        self.update(tx);
    }

    /// The disk block holding the `bn`th block of this file, for reading:
    /// a hole fails with `BMapFailed`.
    fn bmap(&mut self, bn: usize) -> Result<u32> {
        self.bmap_internal(bn, None)
    }

    /// The disk block holding the `bn`th block of this file, allocating
    /// direct or indirect slots as needed.
    fn bmap_or_alloc(&mut self, bn: usize, tx: &Tx) -> Result<u32> {
        self.bmap_internal(bn, Some(tx))
    }

    fn bmap_internal(&mut self, bn: usize, tx_opt: Option<&Tx>) -> Result<u32> {
        let dev = self.dev;

        if bn < NDIRECT {
            let mut addr = self.addr_direct[bn];
            if addr == 0 {
                let tx = tx_opt.ok_or(KernelError::BMapFailed)?;
                addr = tx.balloc(dev)?;
                self.addr_direct[bn] = addr;
            }
            Ok(addr)
        } else {
            let bn = bn - NDIRECT;
            assert!(bn < NINDIRECT, "bmap: out of range");

            // Load the indirect block, allocating if necessary.
            let mut indirect = self.addr_indirect;
            if indirect == 0 {
                let tx = tx_opt.ok_or(KernelError::BMapFailed)?;
                indirect = tx.balloc(dev)?;
                self.addr_indirect = indirect;
            }

            let mut bp = kernel().disk().read(dev, indirect);
            // SAFETY: u32 has no internal structure.
            let (prefix, addrs, _) = unsafe { bp.data_mut().align_to_mut::<u32>() };
            debug_assert_eq!(prefix.len(), 0, "bmap: buf data unaligned");
            let mut addr = addrs[bn];
            if addr == 0 {
                let tx = tx_opt.ok_or(KernelError::BMapFailed)?;
                addr = tx.balloc(dev)?;
                addrs[bn] = addr;
                tx.write(bp);
            } else {
                drop(bp);
            }
            Ok(addr)
        }
    }

    /// Read data from the inode into `dst`; the whole record must be
    /// present.
    pub fn read_kernel<T: AsBytes + FromBytes>(&mut self, dst: &mut T, off: u32) -> Result<()> {
        let read = self.read_bytes_kernel(dst.as_bytes_mut(), off);
        if read == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(KernelError::BMapFailed)
        }
    }

    /// Read data from the inode into a kernel buffer; returns the number
    /// of bytes read.
    pub fn read_bytes_kernel(&mut self, dst: &mut [u8], off: u32) -> usize {
        self.read_internal(off, dst.len() as u32, |off, src| {
            dst[off as usize..off as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
        .expect("read_bytes_kernel: should never fail")
    }

    /// Read `n` bytes at offset `off` into the user address `dst`. The
    /// borrow of the process's memory lives only inside the per-block
    /// copy, never across the sleeping disk reads between them.
    pub fn read_user(
        &mut self,
        proc: &mut CurrentProc<'_>,
        dst: UVAddr,
        off: u32,
        n: u32,
    ) -> Result<usize> {
        self.read_internal(off, n, |off, src| {
            proc.memory_mut().copy_out_bytes(dst.add(off as usize), src)
        })
    }

    /// Read data from the inode.
    ///
    /// `f(off, src)` copies `src` to the interval of the destination that
    /// begins at its `off`th byte. A function argument, because writing to
    /// kernel memory is a single memcpy while writing to user memory walks
    /// the user page table.
    ///
    /// Reading past the end of the file (or an overflowing range) returns
    /// 0 bytes; a range crossing the end is clamped.
    #[inline]
    fn read_internal<F: FnMut(u32, &[u8]) -> Result<()>>(
        &mut self,
        mut off: u32,
        mut n: u32,
        mut f: F,
    ) -> Result<usize> {
        if off > self.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > self.size {
            n = self.size - off;
        }
        let mut tot: u32 = 0;
        while tot < n {
            let blockno = self.bmap(off as usize / BSIZE)?;
            let bp = kernel().disk().read(self.dev, blockno);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let res = f(tot, &bp.data()[begin..begin + m as usize]);
            drop(bp);
            res?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Write data from `src` into the inode; the whole record must be
    /// written.
    pub fn write_kernel<T: AsBytes>(&mut self, src: &T, off: u32, tx: &Tx) -> Result<()> {
        let written = self.write_bytes_kernel(src.as_bytes(), off, tx)?;
        if written == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(KernelError::BMapFailed)
        }
    }

    /// Write a kernel buffer into the inode; returns the number of bytes
    /// written.
    pub fn write_bytes_kernel(&mut self, src: &[u8], off: u32, tx: &Tx) -> Result<usize> {
        self.write_internal(
            off,
            src.len() as u32,
            |off, dst| {
                dst.copy_from_slice(&src[off as usize..off as usize + dst.len()]);
                Ok(())
            },
            tx,
        )
    }

    /// Write `n` bytes from the user address `src` at offset `off`. As in
    /// `read_user`, the memory borrow is scoped to each block copy.
    pub fn write_user(
        &mut self,
        proc: &mut CurrentProc<'_>,
        src: UVAddr,
        off: u32,
        n: u32,
        tx: &Tx,
    ) -> Result<usize> {
        self.write_internal(
            off,
            n,
            |off, dst| proc.memory_mut().copy_in_bytes(dst, src.add(off as usize)),
            tx,
        )
    }

    /// Write data to the inode.
    ///
    /// `f(off, dst)` copies the interval of the source beginning at its
    /// `off`th byte into `dst`; see read_internal for why it is a function
    /// argument.
    ///
    /// A write starting past the end of the file fails with
    /// `OffsetTooLarge`; one that would grow the file past the maximum
    /// size fails with `LenTooLarge`. A write that extends the file
    /// updates its size.
    #[inline]
    fn write_internal<F: FnMut(u32, &mut [u8]) -> Result<()>>(
        &mut self,
        mut off: u32,
        n: u32,
        mut f: F,
        tx: &Tx,
    ) -> Result<usize> {
        if off > self.size {
            return Err(KernelError::OffsetTooLarge);
        }
        if off.checked_add(n).ok_or(KernelError::OffsetTooLarge)? as usize > MAXFILE * BSIZE {
            return Err(KernelError::LenTooLarge);
        }
        let mut tot: u32 = 0;
        while tot < n {
            let blockno = self.bmap_or_alloc(off as usize / BSIZE, tx)?;
            let mut bp = kernel().disk().read(self.dev, blockno);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            if f(tot, &mut bp.data_mut()[begin..begin + m as usize]).is_ok() {
                tx.write(bp);
            } else {
                drop(bp);
                break;
            }
            tot += m;
            off += m;
        }

        if off > self.size {
            self.size = off;
        }

        // Write the inode back to disk even if the size didn't change,
        // because the loop above may have called bmap_or_alloc and added a
        // new block to the address arrays.
        self.update(tx);
        Ok(tot as usize)
    }

    /// Look for a directory entry by name. If found, return a referenced
    /// inode for it and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32)> {
        assert_eq!(self.typ, InodeType::Dir, "dirlookup not DIR");

        let dev = self.dev;
        for off in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_kernel(&mut de, off).expect("dirlookup read");
            if de.inum != 0 && de.get_name() == name {
                return Ok((kernel().itable().get(dev, de.inum as u32), off));
            }
        }
        Err(KernelError::LookupFailed)
    }

    /// Write a new directory entry (name, inum) into this directory.
    /// Fails with `DirNamePresent` when the name is already there.
    pub fn dirlink(&mut self, name: &FileName, inum: u32, tx: &Tx) -> Result<()> {
        // Check that the name is not present.
        if let Ok((ip, _)) = self.dirlookup(name) {
            ip.put(tx);
            return Err(KernelError::DirNamePresent);
        }

        // Look for an empty dirent; append when there is none.
        let mut de = Dirent::default();
        let mut off = 0;
        while off < self.size {
            self.read_kernel(&mut de, off).expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        de.inum = inum as u16;
        de.set_name(name);
        self.write_kernel(&de, off, tx)?;
        Ok(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::default();
        for off in (2 * DIRENT_SIZE as u32..self.size).step_by(DIRENT_SIZE) {
            self.read_kernel(&mut de, off).expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(bytes: &[u8]) -> &FileName {
        // SAFETY: test inputs contain no NUL.
        unsafe { FileName::from_bytes(bytes) }
    }

    #[test]
    fn dinode_layout_matches_the_disk() {
        assert_eq!(mem::size_of::<Dinode>(), 64);
        assert_eq!(mem::size_of::<Dirent>(), 16);
        assert_eq!(MAXFILE, NDIRECT + NINDIRECT);
        assert_eq!(NINDIRECT, BSIZE / 4);
    }

    #[test]
    fn dirent_names_round_trip() {
        let mut de = Dirent::default();
        de.set_name(name(b"console"));
        assert_eq!(de.get_name(), name(b"console"));

        // A maximum-length name fills all but the terminator byte.
        de.set_name(name(b"abcdefghijklm"));
        assert_eq!(de.get_name().as_bytes(), b"abcdefghijklm");
        assert_eq!(de.name[DIRSIZ - 1], 0);
    }

    #[test]
    fn shorter_names_overwrite_longer_ones() {
        let mut de = Dirent::default();
        de.set_name(name(b"abcdefghijklm"));
        de.set_name(name(b"ab"));
        assert_eq!(de.get_name(), name(b"ab"));
    }

    #[test]
    fn disk_type_tags_round_trip() {
        let d = Dinode::from_parts(InodeType::Device { major: 1, minor: 9 }, 1, 0);
        assert_eq!(d.typ(), InodeType::Device { major: 1, minor: 9 });
        let d = Dinode::from_parts(InodeType::Dir, 2, 64);
        assert_eq!(d.typ(), InodeType::Dir);
        assert_eq!(d.nlink, 2);
        assert_eq!(d.size, 64);
        let d = Dinode::from_parts(InodeType::None, 0, 0);
        assert_eq!(d.typ(), InodeType::None);
    }
}
