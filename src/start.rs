//! Machine-mode boot: every hart lands here from the entry assembly.

#![allow(unreachable_pub)]

use crate::param::NCPU;

/// The entry assembly needs one boot stack per CPU.
#[repr(C, align(16))]
pub struct Stack([[u8; 4096]; NCPU]);

impl Stack {
    const fn new() -> Self {
        Self([[0; 4096]; NCPU])
    }
}

#[no_mangle]
pub static mut stack0: Stack = Stack::new();

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        use crate::kernel::kernel_main;
        use crate::riscv::{
            r_mcounteren, r_mhartid, r_time, w_mcounteren, w_medeleg, w_mepc, w_mideleg, w_satp,
            w_stimecmp, w_tp, Menvcfg, Mie, Mstatus, Sie,
        };

        /// Cycles between timer interrupts; about 1/10th second in qemu.
        pub const TIMER_INTERVAL: usize = 1_000_000;

        /// The entry assembly jumps here in machine mode on stack0.
        #[no_mangle]
        pub unsafe extern "C" fn start() -> ! {
            // Set M Previous Privilege mode to Supervisor, for mret.
            let mut x = Mstatus::read();
            x.remove(Mstatus::MPP_MASK);
            x.insert(Mstatus::MPP_S);
            unsafe { x.write() };

            // Set M Exception Program Counter to main, for mret.
            // Requires code model medany.
            unsafe { w_mepc(kernel_main as usize) };

            // Disable paging for now.
            unsafe { w_satp(0) };

            // Delegate all interrupts and exceptions to supervisor mode.
            unsafe {
                w_medeleg(0xffff);
                w_mideleg(0xffff);
                (Sie::read() | Sie::SEIE | Sie::STIE | Sie::SSIE).write();
            }

            // Ask for clock interrupts.
            unsafe { timerinit() };

            // Keep each CPU's hartid in its tp register, for cpuid().
            unsafe { w_tp(r_mhartid()) };

            // Switch to supervisor mode and jump to main().
            unsafe { asm!("mret", options(noreturn)) }
        }

        /// Arrange to receive timer interrupts in supervisor mode, via the
        /// sstc extension's stimecmp compare register.
        unsafe fn timerinit() {
            unsafe {
                // Enable supervisor-mode timer interrupts.
                (Mie::read() | Mie::STIE).write();

                // Enable the sstc extension (i.e. stimecmp).
                (Menvcfg::read() | Menvcfg::STCE).write();

                // Allow supervisor mode to use stimecmp and time.
                w_mcounteren(r_mcounteren() | 2);

                // Ask for the very first timer interrupt.
                w_stimecmp(r_time() + TIMER_INTERVAL);
            }
        }
    }
}
