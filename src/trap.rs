//! Trap handling: user traps, kernel traps, device interrupts, timer ticks.

use core::mem;

use crate::{
    cpu::cpuid,
    kernel::kernel,
    memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ},
    param::KSTACKPAGES,
    plic, println,
    proc::{current_proc, yield_cpu},
    riscv::{
        intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_stval, r_time, r_tp, w_sepc,
        w_stimecmp, w_stvec, Sstatus, PGSIZE,
    },
    syscall::syscall,
    uart,
};

extern "C" {
    // The trampoline page (asm.rs), mapped at TRAMPOLINE in every address
    // space.
    static mut trampoline: [u8; 0];
    static mut uservec: [u8; 0];
    static mut userret: [u8; 0];

    // The in-kernel trap vector (asm.rs); calls kerneltrap().
    fn kernelvec();
}

/// Cycles between timer interrupts; about 1/10th second in qemu.
const TIMER_INTERVAL: usize = 1_000_000;

/// Which kind of device, if any, a trap turned out to be.
#[derive(Copy, Clone, PartialEq)]
enum Intr {
    /// Not a recognized device interrupt.
    None,
    /// UART or virtio disk.
    Device,
    /// Supervisor timer.
    Timer,
}

pub fn trapinit() {
    // Nothing to do.
}

/// Install the kernel trap vector on this hart.
///
/// # Safety
///
/// `kernelvec` must be a valid trap vector; interrupts may fire afterwards.
pub unsafe fn trapinithart() {
    unsafe { w_stvec(kernelvec as usize) };
}

/// Handle an interrupt, exception, or system call from user space.
/// Called from the trampoline's uservec.
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    assert!(
        !Sstatus::read().contains(Sstatus::SPP),
        "usertrap: not from user mode"
    );

    // Send interrupts and exceptions to kerneltrap(), since we're now in
    // the kernel.
    unsafe { w_stvec(kernelvec as usize) };

    let mut proc = current_proc().expect("usertrap");

    // Save user program counter.
    proc.trap_frame_mut().epc = r_sepc();

    let scause = r_scause();
    let mut which = Intr::None;

    if scause == 8 {
        // System call.
        if proc.killed() {
            kernel().procs().exit_current(-1, &mut proc);
        }

        // sepc points to the ecall instruction, but we want to return to
        // the next instruction.
        proc.trap_frame_mut().epc += 4;

        // An interrupt would change sepc, scause and sstatus, so enable
        // interrupts only now that we're done with those registers.
        unsafe { intr_on() };

        syscall(&mut proc);
    } else {
        which = devintr();
        if which == Intr::None {
            println!(
                "usertrap(): unexpected scause {:#x} pid={}",
                scause,
                proc.pid()
            );
            println!("            sepc={:#x} stval={:#x}", r_sepc(), r_stval());
            proc.kill();
        }
    }

    if proc.killed() {
        kernel().procs().exit_current(-1, &mut proc);
    }

    // Give up the CPU if this was a timer interrupt.
    if which == Intr::Timer {
        yield_cpu();
    }

    unsafe { usertrapret() }
}

/// Return to user space through the trampoline.
///
/// # Safety
///
/// The current process has a valid trapframe and user page table.
pub unsafe fn usertrapret() -> ! {
    let mut proc = current_proc().expect("usertrapret");

    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(), so turn off interrupts until we're back in user space,
    // where usertrap() is correct.
    intr_off();

    // Send syscalls, interrupts and exceptions to uservec in the
    // trampoline.
    // SAFETY: taking addresses of statics is safe.
    let trampoline_uservec =
        TRAMPOLINE + unsafe { uservec.as_ptr().offset_from(trampoline.as_ptr()) } as usize;
    unsafe { w_stvec(trampoline_uservec) };

    // Set up the trapframe values that uservec will need when the process
    // next traps into the kernel.
    let kstack = proc.deref_data().kstack;
    let tf = proc.trap_frame_mut();
    tf.kernel_satp = r_satp();
    tf.kernel_sp = kstack + KSTACKPAGES * PGSIZE;
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = r_tp();

    // Set up the registers that the trampoline's sret will use to get to
    // user space.

    // Set S Previous Privilege mode to User, S Previous Interrupt Enable
    // to on.
    let mut x = Sstatus::read();
    x.remove(Sstatus::SPP);
    x.insert(Sstatus::SPIE);
    // SAFETY: interrupts stay off until the sret in userret.
    unsafe { x.write() };

    // Set S Exception Program Counter to the saved user pc.
    unsafe { w_sepc(proc.trap_frame().epc) };

    // Tell the trampoline the user page table to switch to.
    let satp = proc.memory().satp();

    // Jump to userret in the trampoline at the top of memory, which
    // switches to the user page table, restores user registers, and
    // switches to user mode with sret.
    let trampoline_userret =
        TRAMPOLINE + unsafe { userret.as_ptr().offset_from(trampoline.as_ptr()) } as usize;
    // SAFETY: trampoline_userret is the mapped address of userret, and satp
    // refers to the process's page table, which maps the trampoline too.
    let userret_fn: unsafe extern "C" fn(usize) -> ! =
        unsafe { mem::transmute(trampoline_userret) };
    unsafe { userret_fn(satp) }
}

/// Interrupts and exceptions from kernel code come here via kernelvec,
/// on whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = Sstatus::read();

    assert!(
        sstatus.contains(Sstatus::SPP),
        "kerneltrap: not from supervisor mode"
    );
    assert!(!intr_get(), "kerneltrap: interrupts enabled");

    let which = devintr();
    if which == Intr::None {
        // Interrupt or trap from an unknown source.
        println!(
            "scause={:#x} sepc={:#x} stval={:#x}",
            r_scause(),
            r_sepc(),
            r_stval()
        );
        panic!("kerneltrap");
    }

    // Give up the CPU if this was a timer interrupt and a process was
    // running.
    if which == Intr::Timer && current_proc().is_some() {
        yield_cpu();
    }

    // The yield may have caused some traps to occur, so restore the trap
    // registers for kernelvec's sepc instruction.
    unsafe {
        w_sepc(sepc);
        sstatus.write();
    }
}

/// The timer interrupt: hart 0 maintains the global tick count and wakes
/// sleepers; every hart schedules its next interrupt.
fn clockintr() {
    if cpuid() == 0 {
        let mut ticks = kernel().ticks().lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup();
    }

    // Ask for the next timer interrupt; this also clears the interrupt
    // condition.
    // SAFETY: writing stimecmp only schedules an interrupt.
    unsafe { w_stimecmp(r_time() + TIMER_INTERVAL) };
}

/// Check if this trap is a device interrupt and dispatch it if so.
fn devintr() -> Intr {
    let scause = r_scause();

    if scause == 0x8000000000000009 {
        // A supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = plic::claim();

        match irq as usize {
            UART0_IRQ => uart::intr(),
            VIRTIO0_IRQ => kernel().disk().intr(),
            0 => (),
            _ => println!("unexpected interrupt irq={}", irq),
        }

        // The PLIC allows each device to raise at most one interrupt at a
        // time; tell it this IRQ is now allowed again.
        if irq != 0 {
            plic::complete(irq);
        }

        Intr::Device
    } else if scause == 0x8000000000000005 {
        // Supervisor timer interrupt.
        clockintr();
        Intr::Timer
    } else {
        Intr::None
    }
}
