//! Process-related system calls.

use crate::{
    error::{KernelError, Result},
    kernel::kernel,
    proc::CurrentProc,
};

pub fn sys_fork(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let pid = kernel().procs().fork(proc)?;
    Ok(pid as usize)
}

pub fn sys_exit(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let status = proc.argint(0);
    kernel().procs().exit_current(status, proc)
}

pub fn sys_wait(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let addr = proc.argaddr(0);
    let pid = kernel().procs().wait(addr, proc)?;
    Ok(pid as usize)
}

pub fn sys_kill(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let pid = proc.argint(0);
    kernel().procs().kill(pid)?;
    Ok(0)
}

pub fn sys_getpid(proc: &mut CurrentProc<'_>) -> Result<usize> {
    Ok(proc.pid() as usize)
}

/// Grow or shrink the process image by n bytes; returns the old size.
pub fn sys_sbrk(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let n = proc.argint(0);
    proc.memory_mut().resize(n)
}

/// Sleep for n clock ticks.
pub fn sys_sleep(proc: &mut CurrentProc<'_>) -> Result<usize> {
    let n = proc.argint(0);
    if n < 0 {
        return Err(KernelError::BadArg);
    }
    let n = n as u32;

    let mut ticks = kernel().ticks().lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n {
        if proc.killed() {
            return Err(KernelError::ProcIsKilled);
        }
        ticks.sleep();
    }
    Ok(0)
}

/// How many clock ticks have passed since boot.
pub fn sys_uptime(_proc: &mut CurrentProc<'_>) -> Result<usize> {
    Ok(*kernel().ticks().lock() as usize)
}
