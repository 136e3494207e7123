//! System call dispatch and argument fetching.

use core::str;

use cstr_core::CStr;

use crate::{
    error::{KernelError, Result},
    println,
    proc::CurrentProc,
    sysfile, sysproc,
    vm::UVAddr,
};

/// Decode and run the system call the trapframe carries: the number in a7,
/// the arguments in a0..a5. The return value lands in a0; every error
/// becomes -1 there.
pub fn syscall(proc: &mut CurrentProc<'_>) {
    let num = proc.trap_frame().a7;

    let result = match num {
        1 => sysproc::sys_fork(proc),
        2 => sysproc::sys_exit(proc),
        3 => sysproc::sys_wait(proc),
        4 => sysfile::sys_pipe(proc),
        5 => sysfile::sys_read(proc),
        6 => sysproc::sys_kill(proc),
        7 => sysfile::sys_exec(proc),
        8 => sysfile::sys_fstat(proc),
        9 => sysfile::sys_chdir(proc),
        10 => sysfile::sys_dup(proc),
        11 => sysproc::sys_getpid(proc),
        12 => sysproc::sys_sbrk(proc),
        13 => sysproc::sys_sleep(proc),
        14 => sysproc::sys_uptime(proc),
        15 => sysfile::sys_open(proc),
        16 => sysfile::sys_write(proc),
        17 => sysfile::sys_mknod(proc),
        18 => sysfile::sys_unlink(proc),
        19 => sysfile::sys_link(proc),
        20 => sysfile::sys_mkdir(proc),
        21 => sysfile::sys_close(proc),
        _ => {
            let data = proc.deref_data();
            let len = data.name.iter().position(|&c| c == 0).unwrap_or(0);
            println!(
                "{} {}: unknown sys call {}",
                proc.pid(),
                str::from_utf8(&data.name[..len]).unwrap_or("???"),
                num
            );
            Err(KernelError::BadArg)
        }
    };

    proc.trap_frame_mut().a0 = match result {
        Ok(value) => value,
        Err(_) => usize::MAX,
    };
}

impl CurrentProc<'_> {
    fn argraw(&self, n: usize) -> usize {
        let tf = self.trap_frame();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("argraw"),
        }
    }

    /// Fetch the nth 32-bit system call argument.
    pub fn argint(&self, n: usize) -> i32 {
        self.argraw(n) as i32
    }

    /// Retrieve an argument as a user pointer. Doesn't check for legality:
    /// copy in/out do that.
    pub fn argaddr(&self, n: usize) -> UVAddr {
        UVAddr::from(self.argraw(n))
    }

    /// Fetch the nth system call argument as a NUL-terminated string,
    /// copied into `buf`.
    pub fn argstr<'a>(&mut self, n: usize, buf: &'a mut [u8]) -> Result<&'a CStr> {
        let addr = self.argaddr(n);
        self.fetchstr(addr, buf)
    }

    /// Fetch the usize at `addr` from user memory.
    pub fn fetchaddr(&mut self, addr: UVAddr) -> Result<usize> {
        let mut word: usize = 0;
        self.memory_mut().copy_in(&mut word, addr)?;
        Ok(word)
    }

    /// Fetch the NUL-terminated string at `addr` from user memory.
    pub fn fetchstr<'a>(&mut self, addr: UVAddr, buf: &'a mut [u8]) -> Result<&'a CStr> {
        self.memory_mut().copy_in_str(buf, addr)?;

        // SAFETY: buf contains a NUL since copy_in_str succeeded.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr() as *const _) })
    }
}
