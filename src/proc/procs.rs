//! The process table and the per-hart scheduler.

use core::ptr;
use core::str;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use itertools::izip;

use super::{swtch, Context, CurrentProc, Pid, Proc, ProcGuard, Procstate, WaitChannel};
use crate::{
    cpu,
    error::{KernelError, Result},
    kernel::kernel,
    lock::{Spinlock, SpinlockGuard},
    memlayout::kstack,
    page::Page,
    param::{KSTACKPAGES, NPROC, ROOTDEV},
    println,
    riscv::{intr_on, wfi, PGSIZE},
    vm::{Addr, UserMemory, UVAddr},
};

/// A user program that calls exec("/init"); od -t xC initcode.
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0, 0, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0, 0, 0x93, 0x85, 0x35, 0x02, 0x93, 0x08,
    0x70, 0, 0x73, 0, 0, 0, 0x93, 0x08, 0x20, 0, 0x73, 0, 0, 0, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0, 0, 0x24, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// The process table.
///
/// # Safety
///
/// `initial_proc_idx` is written once, before the scheduler first runs, and
/// indexes `pool` afterwards.
pub struct Procs {
    nextpid: AtomicI32,

    pool: [Proc; NPROC],

    /// Index of the init process in `pool`; `NPROC` until user_proc_init.
    initial_proc_idx: AtomicUsize,

    /// Helps ensure that wakeups of wait()ing parents are not lost, and
    /// guards every `Proc::parent` field. Must be acquired before any
    /// process lock.
    wait_lock: Spinlock<()>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            pool: array![_ => Proc::new(); NPROC],
            initial_proc_idx: AtomicUsize::new(NPROC),
            wait_lock: Spinlock::new("wait_lock", ()),
        }
    }

    /// Initialize the process table at boot time: hand each slot its kernel
    /// stack, which KernelMemory::new mapped.
    ///
    /// # Safety
    ///
    /// Must run once, on the boot hart, before any process exists.
    pub unsafe fn init(&self) {
        for (i, p) in self.pool.iter().enumerate() {
            // SAFETY: no process exists yet, so the data is unshared.
            unsafe { (*p.data.get()).kstack = kstack(i) };
        }
    }

    fn allocpid(&self) -> Pid {
        let pid = self.nextpid.fetch_add(1, Ordering::Relaxed);
        assert!(pid > 0, "allocpid: pid overflow");
        pid
    }

    pub fn initial_proc(&self) -> &Proc {
        let idx = self.initial_proc_idx.load(Ordering::Acquire);
        assert!(idx < NPROC, "initial_proc: not initialized");
        &self.pool[idx]
    }

    /// Acquires the wait lock. Any `Proc::parent` access needs this guard.
    fn wait_guard(&self) -> SpinlockGuard<'_, ()> {
        self.wait_lock.lock()
    }

    /// The parent pointer of `p`; the wait-lock guard witnesses exclusion.
    fn parent_mut<'a>(
        &'a self,
        p: &'a Proc,
        _wait: &'a mut SpinlockGuard<'_, ()>,
    ) -> &'a mut *const Proc {
        // SAFETY: parent is protected by wait_lock, which is held.
        unsafe { &mut *p.parent.get() }
    }

    /// Look in the table for an UNUSED slot. If found, initialize the state
    /// required to run in the kernel and return with the process lock held.
    /// Consumes the given trapframe page and user memory; on failure they
    /// are returned to the allocator.
    fn alloc(&self, trap_frame: Page, memory: UserMemory) -> Result<ProcGuard<'_>> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.state() == Procstate::UNUSED {
                // SAFETY: this process cannot be the current process yet.
                let data = unsafe { guard.deref_mut_data() };

                data.trap_frame = trap_frame.into_usize() as *mut _;
                let _ = data.memory.write(memory);

                // Set up a new context to start executing at forkret, which
                // returns to user space.
                data.context = Context::default();
                data.context.ra = forkret as usize;
                data.context.sp = data.kstack + KSTACKPAGES * PGSIZE;

                let pid = self.allocpid();
                let info = guard.deref_mut_info();
                info.pid = pid;
                // Okay since trap_frame and memory are now initialized.
                info.state = Procstate::USED;

                return Ok(guard);
            }
        }

        kernel().free(trap_frame);
        drop(memory);
        Err(KernelError::OutOfSlots)
    }

    /// Set up the first user process.
    ///
    /// # Safety
    ///
    /// Must run once, on the boot hart, after `Procs::init`.
    pub unsafe fn user_proc_init(&self) {
        // Allocate a trapframe page.
        let trap_frame = kernel().alloc().expect("user_proc_init: alloc");

        // Allocate one user page and copy initcode's instructions and data
        // into it.
        let memory = UserMemory::new(trap_frame.addr().into(), Some(&INITCODE))
            .expect("user_proc_init: UserMemory::new");

        let mut guard = self.alloc(trap_frame, memory).expect("user_proc_init");

        // SAFETY: this process cannot be the current process yet.
        let data = unsafe { guard.deref_mut_data() };

        // Prepare for the very first "return" from kernel to user.
        // SAFETY: trap_frame was initialized by alloc.
        unsafe {
            // User program counter.
            (*data.trap_frame).epc = 0;
            // User stack pointer.
            (*data.trap_frame).sp = PGSIZE;
        }

        let name = b"initcode";
        data.name[..name.len()].copy_from_slice(name);

        // The root inode can be referenced before the file system is
        // initialized: iget touches no disk blocks.
        let _ = data.cwd.write(kernel().itable().root());

        guard.deref_mut_info().state = Procstate::RUNNABLE;

        let idx = (guard.proc() as *const Proc as usize - self.pool.as_ptr() as usize)
            / core::mem::size_of::<Proc>();
        self.initial_proc_idx.store(idx, Ordering::Release);
    }

    /// Wake up all processes in the pool sleeping on `target`, except the
    /// current process. Must be called without any process lock.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let current = super::current_proc().map(|p| &*p as *const Proc);
        for p in &self.pool {
            if Some(p as *const Proc) == current {
                continue;
            }
            let mut guard = p.lock();
            if guard.deref_info().waitchannel == target as *const _ {
                guard.wakeup();
            }
        }
    }

    /// Pass p's abandoned children to init.
    fn reparent(&self, proc: *const Proc, wait: &mut SpinlockGuard<'_, ()>) {
        for pp in &self.pool {
            let parent = self.parent_mut(pp, wait);
            if *parent == proc {
                *parent = self.initial_proc();
                self.initial_proc().child_waitchannel.wakeup();
            }
        }
    }

    /// Create a new process, copying the parent. Sets up the child kernel
    /// stack to return as if from the fork() system call.
    pub fn fork(&self, proc: &mut CurrentProc<'_>) -> Result<Pid> {
        // Allocate a trapframe page.
        let trap_frame = kernel().alloc().ok_or(KernelError::OutOfMemory)?;
        let trap_frame = scopeguard::guard(trap_frame, |page| kernel().free(page));

        // Copy user memory from parent to child.
        let memory = proc.memory_mut().clone(trap_frame.addr().into())?;

        // Allocate process.
        let mut np = self.alloc(scopeguard::ScopeGuard::into_inner(trap_frame), memory)?;
        // SAFETY: the new process cannot be the current process yet.
        let npdata = unsafe { np.deref_mut_data() };

        // Copy saved user registers.
        // SAFETY: trap_frame was initialized by alloc.
        unsafe { *npdata.trap_frame = *proc.trap_frame() };

        // Cause fork to return 0 in the child.
        // SAFETY: trap_frame was initialized by alloc.
        unsafe { (*npdata.trap_frame).a0 = 0 };

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(npdata.open_files.iter_mut(), proc.deref_data().open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(file.dup());
            }
        }
        let _ = npdata.cwd.write(proc.cwd().dup());

        npdata.name.copy_from_slice(&proc.deref_data().name);

        let pid = np.deref_info().pid;

        // Drop the child's lock before taking wait_lock; the lock order is
        // wait_lock, then process locks.
        np.reacquire_after(|np| {
            let mut wait = self.wait_guard();
            *self.parent_mut(np, &mut wait) = &**proc as *const Proc;
        });

        // Okay since cwd is now initialized.
        np.deref_mut_info().state = Procstate::RUNNABLE;

        Ok(pid)
    }

    /// Wait for a child process to exit; return its pid. When `addr` is
    /// non-null, the child's exit status is copied there.
    pub fn wait(&self, addr: UVAddr, proc: &mut CurrentProc<'_>) -> Result<Pid> {
        let me = &**proc as *const Proc;
        let mut wait = self.wait_guard();

        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for np in &self.pool {
                if *self.parent_mut(np, &mut wait) == me {
                    // Found a child. Make sure it isn't still in exit() or
                    // swtch().
                    let mut np = np.lock();

                    havekids = true;
                    if np.state() == Procstate::ZOMBIE {
                        let pid = np.deref_info().pid;
                        if !addr.is_null() {
                            let xstate = np.deref_info().xstate;
                            proc.memory_mut().copy_out(addr, &xstate)?;
                        }
                        // Reap the zombie.
                        *self.parent_mut(&np, &mut wait) = ptr::null();
                        // SAFETY: the child is a ZOMBIE: not running and
                        // with no CurrentProc alive for it.
                        unsafe { np.clear() };
                        return Ok(pid);
                    }
                }
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(KernelError::NoChildAvailable);
            }
            if proc.killed() {
                return Err(KernelError::ProcIsKilled);
            }

            // Wait for a child to exit.
            proc.child_waitchannel.sleep(&mut wait);
        }
    }

    /// Kill the process with the given pid. The victim won't exit until it
    /// tries to return to user space.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid && guard.state() != Procstate::UNUSED {
                p.kill();
                guard.wakeup();
                return Ok(());
            }
        }
        Err(KernelError::PidNotFound)
    }

    /// Exit the current process. Does not return. An exited process remains
    /// in the zombie state until its parent calls wait().
    pub fn exit_current(&self, status: i32, proc: &mut CurrentProc<'_>) -> ! {
        let me = &**proc as *const Proc;
        assert!(
            !ptr::eq(me, self.initial_proc()),
            "init exiting"
        );

        // Close all open files. The descriptor slot's borrow must end
        // before the close, which can sleep in the journal.
        for fd in 0..crate::param::NOFILE {
            let file = proc.deref_mut_data().open_files[fd].take();
            if let Some(f) = file {
                f.close();
            }
        }

        // Release the working directory inside a journal transaction, since
        // the release may free disk blocks.
        let tx = kernel().fs().begin_tx();
        // SAFETY: cwd is initialized and the process will never run again.
        let cwd = unsafe { proc.deref_mut_data().cwd.assume_init_read() };
        cwd.put(&tx);
        drop(tx);

        let mut wait = self.wait_guard();

        // Give our children to init.
        self.reparent(me, &mut wait);

        // The parent might be sleeping in wait().
        let parent = *self.parent_mut(proc, &mut wait);
        // SAFETY: parent is valid: we are not init, and the parent cannot
        // be reaped while wait_lock is held.
        unsafe { (*parent).child_waitchannel.wakeup() };

        let mut guard = proc.lock();
        guard.deref_mut_info().xstate = status;
        guard.deref_mut_info().state = Procstate::ZOMBIE;

        drop(wait);

        // Jump into the scheduler, never to return.
        // SAFETY: the process lock is held and the state is ZOMBIE.
        unsafe { guard.sched() };

        unreachable!("zombie exit");
    }

    /// Per-hart process scheduler. Each hart calls scheduler() after
    /// setting itself up; it never returns. It loops, picking a RUNNABLE
    /// process, switching to it, and regaining control when the process
    /// calls sched.
    pub unsafe fn scheduler(&self) -> ! {
        let c = cpu::current_raw();
        // SAFETY: this thread never migrates; it is the hart's scheduler.
        unsafe { (*c).proc = ptr::null() };

        loop {
            // Avoid deadlock by ensuring that devices can interrupt.
            unsafe { intr_on() };

            let mut found = false;
            for p in &self.pool {
                let mut guard = p.lock();
                if guard.state() == Procstate::RUNNABLE {
                    // Switch to the chosen process. It is the process's job
                    // to release its lock and then reacquire it before
                    // jumping back to us.
                    guard.deref_mut_info().state = Procstate::RUNNING;
                    unsafe {
                        (*c).proc = p as *const Proc;
                        swtch(&mut (*c).context, &mut guard.deref_mut_data().context);

                        // The process is done running for now; it changed
                        // its state before coming back.
                        (*c).proc = ptr::null();
                    }
                    found = true;
                }
                drop(guard);
            }

            if !found {
                // Nothing to run; stop on this hart until an interrupt.
                unsafe { intr_on() };
                wfi();
            }
        }
    }

    /// Print a process listing to the console, for when a user types ^P.
    /// Takes no locks, to avoid wedging a stuck machine further.
    pub fn dump(&self) {
        println!();
        for p in &self.pool {
            // SAFETY: racy by design; values are only printed.
            let info = unsafe { &*p.info.get_mut_raw() };
            if let Procstate::UNUSED = info.state {
                continue;
            }
            let name = unsafe { &(*p.data.get()).name };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {} {}",
                info.pid,
                info.state.as_str(),
                str::from_utf8(&name[..len]).unwrap_or("???")
            );
        }
    }
}

impl ProcGuard<'_> {
    fn proc(&self) -> &Proc {
        self
    }

    /// Free a proc structure and the data hanging from it, including user
    /// pages. The parent field must already be cleared.
    ///
    /// # Safety
    ///
    /// `state` ≠ `UNUSED` and no thread can be running in the process.
    pub(super) unsafe fn clear(&mut self) {
        // SAFETY: this process is not the current process of any hart.
        let data = unsafe { self.deref_mut_data() };
        let trap_frame = core::mem::replace(&mut data.trap_frame, ptr::null_mut());
        // SAFETY: trap_frame uniquely refers to a valid page.
        kernel().free(unsafe { Page::from_usize(trap_frame as usize) });
        // SAFETY: memory was initialized (state ≠ UNUSED) and becomes
        // uninit again as the state goes back to UNUSED.
        unsafe {
            core::mem::replace(&mut data.memory, core::mem::MaybeUninit::uninit()).assume_init_drop()
        };

        data.name[0] = 0;

        let info = self.deref_mut_info();
        info.waitchannel = ptr::null();
        info.pid = 0;
        info.xstate = 0;
        info.state = Procstate::UNUSED;

        self.killed.store(false, core::sync::atomic::Ordering::Release);
    }
}

/// A fork child's very first scheduling by scheduler() will swtch to
/// forkret.
pub unsafe extern "C" fn forkret() -> ! {
    let p = super::current_proc().expect("forkret");

    // Still holding the process lock from scheduler.
    unsafe { p.info.unlock() };

    // File system initialization must run in the context of a regular
    // process (it sleeps), and thus cannot be run by the boot path.
    kernel().fs().init(ROOTDEV);

    // SAFETY: returning to user space through the trampoline for the first
    // time.
    unsafe { crate::trap::usertrapret() }
}
