//! File-related system calls. Mostly argument checking (since we don't
//! trust user code) and calls into the file, inode and pipe layers.

use core::cell::UnsafeCell;
use core::convert::TryFrom;
use core::mem;

use arrayvec::ArrayVec;

use crate::{
    error::{KernelError, Result},
    exec::exec,
    fcntl::FcntlFlags,
    file::{File, FileType, RcFile},
    fs::{FileName, InodeGuard, InodeType, Path, RcInode, Tx},
    kernel::kernel,
    page::Page,
    param::{MAXARG, MAXPATH, NDEV, NOFILE},
    pipe::AllocatedPipe,
    proc::CurrentProc,
    vm::{Addr, UVAddr},
};

/// Fetch the nth word-sized system call argument as a file descriptor and
/// return a duplicate handle on the corresponding open file.
fn argfd(proc: &CurrentProc<'_>, n: usize) -> Result<(usize, RcFile)> {
    let fd = proc.argint(n);
    let f = usize::try_from(fd)
        .ok()
        .and_then(|fd| proc.deref_data().open_files.get(fd)?.as_ref())
        .ok_or(KernelError::BadFd)?;
    Ok((fd as usize, f.dup()))
}

pub fn sys_dup(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let (_, f) = argfd(proc, 0)?;
    f.fdalloc(proc)
}

pub fn sys_read(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let (_, f) = argfd(proc, 0)?;
    let addr = proc.argaddr(1);
    let n = proc.argint(2);
    let r = f.read(proc, addr, n as usize);
    f.close();
    r
}

pub fn sys_write(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let (_, f) = argfd(proc, 0)?;
    let addr = proc.argaddr(1);
    let n = proc.argint(2);
    let r = f.write(proc, addr, n as usize);
    f.close();
    r
}

pub fn sys_close(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let fd = proc.argint(0);
    let fd = usize::try_from(fd)
        .ok()
        .filter(|fd| *fd < NOFILE)
        .ok_or(KernelError::BadFd)?;
    let file = proc.deref_mut_data().open_files[fd]
        .take()
        .ok_or(KernelError::BadFd)?;
    file.close();
    Ok(0)
}

pub fn sys_fstat(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let (_, f) = argfd(proc, 0)?;
    let addr = proc.argaddr(1);
    let r = f.stat(proc, addr);
    f.close();
    r.map(|_| 0)
}

/// Create the path `new` as a link to the same inode as `old`.
pub fn sys_link(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old = proc.argstr(0, &mut old_buf)?;
    let new = proc.argstr(1, &mut new_buf)?;
    let old = Path::new(old);
    let new = Path::new(new);

    let tx = kernel().fs().begin_tx();

    let ip = kernel().itable().namei(old, &tx)?;
    let mut guard = ip.lock();
    if guard.typ == InodeType::Dir {
        drop(guard);
        ip.put(&tx);
        return Err(KernelError::PermissionDenied);
    }
    guard.nlink += 1;
    guard.update(&tx);
    drop(guard);

    let result = (|| {
        let (dp, name) = kernel().itable().nameiparent(new, &tx)?;
        let mut dpg = dp.lock();
        if dpg.dev != ip.dev {
            drop(dpg);
            dp.put(&tx);
            return Err(KernelError::LookupFailed);
        }
        if let Err(e) = dpg.dirlink(name, ip.inum, &tx) {
            drop(dpg);
            dp.put(&tx);
            return Err(e);
        }
        drop(dpg);
        dp.put(&tx);
        Ok(())
    })();

    match result {
        Ok(()) => {
            ip.put(&tx);
            Ok(0)
        }
        Err(e) => {
            // Undo the link count.
            let mut guard = ip.lock();
            guard.nlink -= 1;
            guard.update(&tx);
            drop(guard);
            ip.put(&tx);
            Err(e)
        }
    }
}

pub fn sys_unlink(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let path = Path::new(path);

    let tx = kernel().fs().begin_tx();

    let (dp, name) = kernel().itable().nameiparent(path, &tx)?;
    let mut dpg = dp.lock();

    let result = (|| {
        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(KernelError::DirNotEmpty);
        }

        let (ip, off) = dpg.dirlookup(name)?;
        let mut ipg = ip.lock();
        assert!(ipg.nlink >= 1, "unlink: nlink < 1");

        if ipg.typ == InodeType::Dir && !ipg.is_dir_empty() {
            drop(ipg);
            ip.put(&tx);
            return Err(KernelError::DirNotEmpty);
        }

        dpg.write_kernel(&crate::fs::Dirent::default(), off, &tx)
            .expect("unlink: write_kernel");
        if ipg.typ == InodeType::Dir {
            dpg.nlink -= 1;
            dpg.update(&tx);
        }
        Ok((ip, ipg))
    })();

    drop(dpg);
    dp.put(&tx);

    let (ip, mut ipg) = result?;
    ipg.nlink -= 1;
    ipg.update(&tx);
    drop(ipg);
    ip.put(&tx);
    Ok(0)
}

/// Create a new inode at `path` with the given type, linking it into its
/// parent directory. Returns the new (or, when opening an existing file,
/// the found) inode, locked.
fn create(path: &Path, typ: InodeType, tx: &Tx) -> Result<(RcInode, InodeGuard<'static>)> {
    let (dp, name) = kernel().itable().nameiparent(path, tx)?;
    let mut dpg = dp.lock();

    if let Ok((ip, _)) = dpg.dirlookup(name) {
        drop(dpg);
        dp.put(tx);
        let ipg = ip.lock();
        if typ == InodeType::File
            && matches!(ipg.typ, InodeType::File | InodeType::Device { .. })
        {
            return Ok((ip, ipg));
        }
        drop(ipg);
        ip.put(tx);
        return Err(KernelError::DirNamePresent);
    }

    let ip = match kernel().itable().alloc_inode(dpg.dev, typ, tx) {
        Ok(ip) => ip,
        Err(e) => {
            drop(dpg);
            dp.put(tx);
            return Err(e);
        }
    };
    let mut ipg = ip.lock();
    ipg.nlink = 1;
    ipg.update(tx);

    let linked = {
        let mut link = || -> Result<()> {
            if typ == InodeType::Dir {
                // Create . and .. entries. No nlink++ for ".": avoid a
                // cyclic reference count.
                // SAFETY: neither name contains a NUL.
                let dot = unsafe { FileName::from_bytes(b".") };
                let dotdot = unsafe { FileName::from_bytes(b"..") };
                ipg.dirlink(dot, ip.inum, tx)?;
                ipg.dirlink(dotdot, dp.inum, tx)?;
            }
            dpg.dirlink(name, ip.inum, tx)?;
            if typ == InodeType::Dir {
                // For "..".
                dpg.nlink += 1;
                dpg.update(tx);
            }
            Ok(())
        };
        link()
    };

    match linked {
        Ok(()) => {
            drop(dpg);
            dp.put(tx);
            Ok((ip, ipg))
        }
        Err(e) => {
            // Deallocate the fresh inode.
            ipg.nlink = 0;
            ipg.update(tx);
            drop(ipg);
            ip.put(tx);
            drop(dpg);
            dp.put(tx);
            Err(e)
        }
    }
}

pub fn sys_open(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let path = Path::new(path);
    let omode = FcntlFlags::from_bits_truncate(proc.argint(1));

    let tx = kernel().fs().begin_tx();

    let (ip, mut ipg) = if omode.contains(FcntlFlags::O_CREATE) {
        create(path, InodeType::File, &tx)?
    } else {
        let ip = kernel().itable().namei(path, &tx)?;
        let ipg = ip.lock();
        if ipg.typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
            drop(ipg);
            ip.put(&tx);
            return Err(KernelError::PermissionDenied);
        }
        (ip, ipg)
    };

    if let InodeType::Device { major, .. } = ipg.typ {
        if major as usize >= NDEV {
            drop(ipg);
            ip.put(&tx);
            return Err(KernelError::BadFd);
        }
    }

    if omode.contains(FcntlFlags::O_TRUNC) && ipg.typ == InodeType::File {
        ipg.itrunc(&tx);
    }

    let typ = match ipg.typ {
        InodeType::Device { major, .. } => FileType::Device { ip, major },
        _ => FileType::Inode {
            ip,
            off: UnsafeCell::new(0),
        },
    };
    drop(ipg);

    let f = match kernel()
        .ftable()
        .alloc(File::new(typ, omode.readable(), omode.writable()))
    {
        Ok(f) => f,
        Err(file) => {
            match file.typ {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => ip.put(&tx),
                _ => (),
            }
            return Err(KernelError::OutOfSlots);
        }
    };
    drop(tx);

    f.fdalloc(proc)
}

pub fn sys_mkdir(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let path = Path::new(path);

    let tx = kernel().fs().begin_tx();
    let (ip, ipg) = create(path, InodeType::Dir, &tx)?;
    drop(ipg);
    ip.put(&tx);
    Ok(0)
}

pub fn sys_mknod(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let path = Path::new(path);
    let major = proc.argint(1) as u16;
    let minor = proc.argint(2) as u16;

    let tx = kernel().fs().begin_tx();
    let (ip, ipg) = create(path, InodeType::Device { major, minor }, &tx)?;
    drop(ipg);
    ip.put(&tx);
    Ok(0)
}

pub fn sys_chdir(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let path = Path::new(path);

    let tx = kernel().fs().begin_tx();
    let ip = kernel().itable().namei(path, &tx)?;
    let ipg = ip.lock();
    if ipg.typ != InodeType::Dir {
        drop(ipg);
        ip.put(&tx);
        return Err(KernelError::NotADirectory);
    }
    drop(ipg);

    // SAFETY: cwd is initialized for a process running in user space.
    let old = unsafe { mem::replace(proc.deref_mut_data().cwd.assume_init_mut(), ip) };
    old.put(&tx);
    Ok(0)
}

pub fn sys_exec(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let mut path_buf = [0u8; MAXPATH];
    let path = proc.argstr(0, &mut path_buf)?;
    let uargv = proc.argaddr(1);

    // Gather the argument strings, one page each.
    let mut args = scopeguard::guard(ArrayVec::<Page, MAXARG>::new(), |args| {
        for page in args {
            kernel().free(page);
        }
    });
    for i in 0.. {
        if i >= MAXARG {
            return Err(KernelError::ExecFailed);
        }
        let uarg = proc.fetchaddr(uargv.add(i * mem::size_of::<usize>()))?;
        if uarg == 0 {
            break;
        }

        let mut page = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
        match proc.fetchstr(UVAddr::from(uarg), &mut page[..]) {
            Ok(_) => args.push(page),
            Err(e) => {
                kernel().free(page);
                return Err(e);
            }
        }
    }

    exec(proc, Path::new(path), &args)
}

pub fn sys_pipe(proc: &mut CurrentProc<'_>) -> Result<usize> {
    // The user address of an array of two file descriptors.
    let fdarray = proc.argaddr(0);

    let (reader, writer) = AllocatedPipe::alloc()?;

    let fd0 = match reader.fdalloc(proc) {
        Ok(fd) => fd,
        Err(e) => {
            writer.close();
            return Err(e);
        }
    };
    let fd1 = match writer.fdalloc(proc) {
        Ok(fd) => fd,
        Err(e) => {
            let f = proc.deref_mut_data().open_files[fd0].take().expect("sys_pipe");
            f.close();
            return Err(e);
        }
    };

    let pair = [fd0 as i32, fd1 as i32];
    if let Err(e) = proc.memory_mut().copy_out(fdarray, &pair) {
        let f0 = proc.deref_mut_data().open_files[fd0].take().expect("sys_pipe");
        let f1 = proc.deref_mut_data().open_files[fd1].take().expect("sys_pipe");
        f0.close();
        f1.close();
        return Err(e);
    }
    Ok(0)
}
