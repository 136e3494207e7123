//! Processes: per-process state, the process table, and the scheduler.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::{
    cpu,
    file::RcFile,
    fs::RcInode,
    lock::Spinlock,
    param::{MAXPROCNAME, NOFILE},
    riscv::intr_get,
    vm::UserMemory,
};

mod procs;
mod wait_channel;

pub use procs::{forkret, Procs};
pub use wait_channel::WaitChannel;

extern "C" {
    // swtch.S (asm.rs): save the callee-saved registers into the first
    // context and restore them from the second.
    pub fn swtch(old: *mut Context, new: *mut Context);
}

/// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // Callee-saved.
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-process data for the trap handling code in the trampoline.
///
/// Sits in a page by itself just under the trampoline page in the user page
/// table; not specially mapped in the kernel page table. uservec saves user
/// registers in the trapframe, then initializes sp and tp from the
/// kernel_sp and kernel_hartid fields, and jumps to kernel_trap. usertrapret
/// and userret set up the trapframe's kernel_* fields, restore user
/// registers from the trapframe, switch to the user page table, and enter
/// user space. The layout is known to the trampoline assembly; do not
/// reorder.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,
    /*   8 */ pub kernel_sp: usize,
    /*  16 */ pub kernel_trap: usize,
    /*  24 */ pub epc: usize,
    /*  32 */ pub kernel_hartid: usize,
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    fn as_str(self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Proc's spinlock must be held when using these.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this channel.
    pub waitchannel: *const WaitChannel,

    /// Exit status to be returned to parent's wait.
    pub xstate: i32,

    /// Process ID.
    pub pid: Pid,
}

// SAFETY: waitchannel is used only as an opaque token; the pointee is never
// dereferenced through ProcInfo.
unsafe impl Send for ProcInfo {}

/// Private to the process, so the process lock need not be held.
pub struct ProcData {
    /// Virtual address of kernel stack.
    pub kstack: usize,

    /// Trap-handling data page; see TrapFrame.
    pub trap_frame: *mut TrapFrame,

    /// User memory manager.
    pub memory: MaybeUninit<UserMemory>,

    /// swtch() here to run process.
    pub context: Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: MaybeUninit<RcInode>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            trap_frame: ptr::null_mut(),
            memory: MaybeUninit::uninit(),
            context: Context::new(),
            open_files: array![_ => None; NOFILE],
            cwd: MaybeUninit::uninit(),
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// * If `info.state` ≠ `UNUSED`, then `data.trap_frame` points to a valid
///   page and `data.memory` has been initialized.
/// * If `info.state` ∉ { `UNUSED`, `USED` }, then `data.cwd` has been
///   initialized and `parent` is null or valid. `parent` is null only for
///   the initial process.
pub struct Proc {
    /// Parent process. Protected by the process table's wait_lock.
    pub(super) parent: UnsafeCell<*const Proc>,

    pub info: Spinlock<ProcInfo>,

    pub(super) data: UnsafeCell<ProcData>,

    /// Wait channel saying a child proc is dead.
    pub child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

// SAFETY: parent is only touched under wait_lock, and data only by the
// owning thread (or by a ProcGuard under the documented conditions).
unsafe impl Sync for Proc {}

impl Proc {
    pub(super) const fn new() -> Self {
        Self {
            parent: UnsafeCell::new(ptr::null()),
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::UNUSED,
                    waitchannel: ptr::null(),
                    xstate: 0,
                    pid: 0,
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the process as killed. The victim acts on it the next time it
    /// crosses a kill checkpoint (user-trap return, wait, pipe I/O).
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Acquires the process's own lock.
    pub fn lock(&self) -> ProcGuard<'_> {
        mem::forget(self.info.lock());
        ProcGuard { proc: self }
    }
}

/// # Safety
///
/// `proc.info` is locked by the current thread.
pub struct ProcGuard<'s> {
    proc: &'s Proc,
}

impl<'s> ProcGuard<'s> {
    pub fn deref_info(&self) -> &ProcInfo {
        // SAFETY: proc.info is locked.
        unsafe { &*self.info.get_mut_raw() }
    }

    pub fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: proc.info is locked and &mut self is exclusive.
        unsafe { &mut *self.info.get_mut_raw() }
    }

    pub fn state(&self) -> Procstate {
        self.deref_info().state
    }

    /// Returns a mutable reference to this process's private data. There is
    /// no race between `ProcGuard`s since the lock of `info` is held, but a
    /// `CurrentProc` can reach the same data without it.
    ///
    /// # Safety
    ///
    /// No `CurrentProc` referring to the same `Proc` may be alive, unless
    /// it is this thread's own and this thread is inside `sched`.
    pub unsafe fn deref_mut_data(&mut self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Switch to the hart's scheduler. Must hold only the process's own
    /// lock and have changed proc->state. Saves and restores
    /// interrupt_enabled because it is a property of this kernel thread,
    /// not this CPU.
    ///
    /// # Safety
    ///
    /// The process lock is held, interrupts are disabled, and the state has
    /// been changed away from RUNNING.
    pub unsafe fn sched(&mut self) {
        assert!(!intr_get(), "sched interruptible");
        assert_ne!(self.state(), Procstate::RUNNING, "sched running");

        // SAFETY: interrupts are disabled.
        let c = cpu::current_raw();
        unsafe {
            assert_eq!((*c).noff, 1, "sched locks");
            let interrupt_enabled = (*c).interrupt_enabled;

            swtch(&mut self.deref_mut_data().context, &mut (*c).context);

            // We cannot use `c` again: swtch may have moved this thread to
            // another hart.
            let c = cpu::current_raw();
            (*c).interrupt_enabled = interrupt_enabled;
        }
    }

    /// Wake process from sleep().
    pub(super) fn wakeup(&mut self) {
        if self.state() == Procstate::SLEEPING {
            self.deref_mut_info().state = Procstate::RUNNABLE;
        }
    }

    /// Temporarily releases the process lock while running `f`.
    pub(super) fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce(&Proc) -> U,
    {
        // SAFETY: the release is temporary and self is not used inside f.
        unsafe { self.info.unlock() };
        let result = f(self.proc);
        mem::forget(self.info.lock());
        result
    }
}

impl Deref for ProcGuard<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is going away.
        unsafe { self.info.unlock() };
    }
}

/// A handle to the process currently running on this hart.
///
/// Grants access to the process's private `ProcData`: the owning thread is
/// the only one that touches it, so no lock is needed. By convention at
/// most one `CurrentProc` is alive per thread at a time; methods returning
/// `&mut` rely on it.
pub struct CurrentProc<'s> {
    inner: &'s Proc,
}

impl<'s> CurrentProc<'s> {
    pub fn pid(&self) -> Pid {
        // SAFETY: pid is not modified while the process runs.
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    pub fn deref_data(&self) -> &ProcData {
        // SAFETY: data is private to this thread.
        unsafe { &*self.inner.data.get() }
    }

    pub fn deref_mut_data(&mut self) -> &mut ProcData {
        // SAFETY: data is private to this thread, and &mut self is
        // exclusive.
        unsafe { &mut *self.inner.data.get() }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: trap_frame is valid since the process is not UNUSED.
        unsafe { &*self.deref_data().trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: trap_frame is valid since the process is not UNUSED.
        unsafe { &mut *self.deref_mut_data().trap_frame }
    }

    pub fn memory(&self) -> &UserMemory {
        // SAFETY: memory is initialized since the process is not UNUSED.
        unsafe { self.deref_data().memory.assume_init_ref() }
    }

    pub fn memory_mut(&mut self) -> &mut UserMemory {
        // SAFETY: memory is initialized since the process is not UNUSED.
        unsafe { (*self.inner.data.get()).memory.assume_init_mut() }
    }

    pub fn cwd(&self) -> &RcInode {
        // SAFETY: cwd is initialized since the process runs in user space.
        unsafe { self.deref_data().cwd.assume_init_ref() }
    }
}

impl Deref for CurrentProc<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_holds_the_fourteen_callee_saved_registers() {
        assert_eq!(core::mem::size_of::<Context>(), 14 * 8);
    }

    #[test]
    fn trapframe_layout_matches_the_trampoline() {
        let tf = core::mem::MaybeUninit::<TrapFrame>::uninit();
        let base = tf.as_ptr() as usize;
        // The offsets the trampoline assembly loads and stores at.
        unsafe {
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).kernel_satp) as usize - base, 0);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).kernel_sp) as usize - base, 8);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).kernel_trap) as usize - base, 16);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).epc) as usize - base, 24);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).kernel_hartid) as usize - base, 32);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).ra) as usize - base, 40);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).a0) as usize - base, 112);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).a7) as usize - base, 168);
            assert_eq!(core::ptr::addr_of!((*tf.as_ptr()).t6) as usize - base, 280);
        }
    }
}

/// Returns a handle to the process running on this hart, or `None` from the
/// scheduler context.
pub fn current_proc() -> Option<CurrentProc<'static>> {
    // SAFETY: balanced with pop_off below.
    unsafe { cpu::push_off() };
    let p = unsafe { (*cpu::current_raw()).proc };
    unsafe { cpu::pop_off() };
    // SAFETY: a non-null cpu->proc points into the static process table and
    // stays valid while it is this hart's current process.
    Some(CurrentProc {
        inner: unsafe { p.as_ref()? },
    })
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    let p = current_proc().expect("yield_cpu");
    let mut guard = p.lock();
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    // SAFETY: we hold the process lock and changed the state.
    unsafe { guard.sched() };
}
