//! RISC-V CSR accessors and Sv39 address arithmetic.

use bitflags::bitflags;

bitflags! {
    /// Machine Status Register, mstatus.
    pub struct Mstatus: usize {
        /// Previous mode.
        const MPP_MASK = (3) << 11;
        const MPP_M = (3) << 11;
        const MPP_S = (1) << 11;
        const MPP_U = (0) << 11;
        /// Machine-mode interrupt enable.
        const MIE = (1) << 3;
    }
}

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User.
        const SPP = (1) << 8;

        /// Supervisor Previous Interrupt Enable.
        const SPIE = (1) << 5;

        /// Supervisor Interrupt Enable.
        const SIE = (1) << 1;
    }
}

bitflags! {
    /// Supervisor Interrupt Enable, sie.
    pub struct Sie: usize {
        /// External.
        const SEIE = (1) << 9;
        /// Timer.
        const STIE = (1) << 5;
        /// Software.
        const SSIE = (1) << 1;
    }
}

bitflags! {
    /// Machine Interrupt Enable, mie.
    pub struct Mie: usize {
        /// External.
        const MEIE = (1) << 11;
        /// Timer.
        const MTIE = (1) << 7;
        /// Supervisor timer.
        const STIE = (1) << 5;
        /// Software.
        const MSIE = (1) << 3;
    }
}

bitflags! {
    /// Machine Environment Configuration Register, menvcfg.
    pub struct Menvcfg: usize {
        /// Sstc extension: stimecmp is writable in S-mode.
        const STCE = (1) << 63;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        impl Mstatus {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {x}, mstatus", x = out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw mstatus, {x}", x = in(reg) self.bits()) };
            }
        }

        impl Sstatus {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {x}, sstatus", x = out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw sstatus, {x}", x = in(reg) self.bits()) };
            }
        }

        impl Sie {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {x}, sie", x = out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw sie, {x}", x = in(reg) self.bits()) };
            }
        }

        impl Mie {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {x}, mie", x = out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw mie, {x}", x = in(reg) self.bits()) };
            }
        }

        impl Menvcfg {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {x}, menvcfg", x = out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw menvcfg, {x}", x = in(reg) self.bits()) };
            }
        }

        /// Which hart (core) is this?
        #[inline]
        pub fn r_mhartid() -> usize {
            let x;
            unsafe { asm!("csrr {x}, mhartid", x = out(reg) x) };
            x
        }

        /// Machine exception program counter; holds the instruction address
        /// to which mret will go.
        #[inline]
        pub unsafe fn w_mepc(x: usize) {
            unsafe { asm!("csrw mepc, {x}", x = in(reg) x) };
        }

        /// Machine Exception Delegation.
        #[inline]
        pub unsafe fn w_medeleg(x: usize) {
            unsafe { asm!("csrw medeleg, {x}", x = in(reg) x) };
        }

        /// Machine Interrupt Delegation.
        #[inline]
        pub unsafe fn w_mideleg(x: usize) {
            unsafe { asm!("csrw mideleg, {x}", x = in(reg) x) };
        }

        /// Machine-mode Counter-Enable.
        #[inline]
        pub unsafe fn w_mcounteren(x: usize) {
            unsafe { asm!("csrw mcounteren, {x}", x = in(reg) x) };
        }

        #[inline]
        pub fn r_mcounteren() -> usize {
            let x;
            unsafe { asm!("csrr {x}, mcounteren", x = out(reg) x) };
            x
        }

        /// Supervisor exception program counter; holds the instruction
        /// address to which sret will go.
        #[inline]
        pub unsafe fn w_sepc(x: usize) {
            unsafe { asm!("csrw sepc, {x}", x = in(reg) x) };
        }

        #[inline]
        pub fn r_sepc() -> usize {
            let x;
            unsafe { asm!("csrr {x}, sepc", x = out(reg) x) };
            x
        }

        /// Supervisor Trap-Vector Base Address; low two bits are mode.
        #[inline]
        pub unsafe fn w_stvec(x: usize) {
            unsafe { asm!("csrw stvec, {x}", x = in(reg) x) };
        }

        /// Supervisor address translation and protection; holds the address
        /// of the page table.
        #[inline]
        pub unsafe fn w_satp(x: usize) {
            unsafe { asm!("csrw satp, {x}", x = in(reg) x) };
        }

        #[inline]
        pub fn r_satp() -> usize {
            let x;
            unsafe { asm!("csrr {x}, satp", x = out(reg) x) };
            x
        }

        /// Supervisor Trap Cause.
        #[inline]
        pub fn r_scause() -> usize {
            let x;
            unsafe { asm!("csrr {x}, scause", x = out(reg) x) };
            x
        }

        /// Supervisor Trap Value.
        #[inline]
        pub fn r_stval() -> usize {
            let x;
            unsafe { asm!("csrr {x}, stval", x = out(reg) x) };
            x
        }

        /// Machine-mode cycle counter.
        #[inline]
        pub fn r_time() -> usize {
            let x;
            unsafe { asm!("csrr {x}, time", x = out(reg) x) };
            x
        }

        /// Supervisor timer compare register (the sstc extension).
        #[inline]
        pub unsafe fn w_stimecmp(x: usize) {
            unsafe { asm!("csrw stimecmp, {x}", x = in(reg) x) };
        }

        /// Read and write tp, the thread pointer, which holds this core's
        /// hartid, the index into cpus[].
        #[inline]
        pub fn r_tp() -> usize {
            let x;
            unsafe { asm!("mv {x}, tp", x = out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_tp(x: usize) {
            unsafe { asm!("mv tp, {x}", x = in(reg) x) };
        }

        /// Flush the TLB. The zero, zero means flush all TLB entries.
        #[inline]
        pub unsafe fn sfence_vma() {
            unsafe { asm!("sfence.vma zero, zero") };
        }

        /// Wait for an interrupt with interrupts enabled; cheaper than
        /// spinning in the scheduler's idle loop.
        #[inline]
        pub fn wfi() {
            unsafe { asm!("wfi") };
        }

        /// Enable device interrupts.
        #[inline]
        pub unsafe fn intr_on() {
            unsafe { (Sstatus::read() | Sstatus::SIE).write() };
        }

        /// Disable device interrupts.
        #[inline]
        pub fn intr_off() {
            // SAFETY: clearing SIE only delays interrupt delivery.
            unsafe { (Sstatus::read() - Sstatus::SIE).write() };
        }

        /// Are device interrupts enabled?
        #[inline]
        pub fn intr_get() -> bool {
            Sstatus::read().contains(Sstatus::SIE)
        }
    } else {
        // Inert substitutes so the architecture-independent logic builds
        // (and its unit tests run) on a non-RISC-V host. None of these are
        // reachable from the tests.

        impl Mstatus {
            pub fn read() -> Self { unreachable!() }
            pub unsafe fn write(self) { unreachable!() }
        }

        impl Sstatus {
            pub fn read() -> Self { unreachable!() }
            pub unsafe fn write(self) { unreachable!() }
        }

        impl Sie {
            pub fn read() -> Self { unreachable!() }
            pub unsafe fn write(self) { unreachable!() }
        }

        impl Mie {
            pub fn read() -> Self { unreachable!() }
            pub unsafe fn write(self) { unreachable!() }
        }

        impl Menvcfg {
            pub fn read() -> Self { unreachable!() }
            pub unsafe fn write(self) { unreachable!() }
        }

        pub fn r_mhartid() -> usize { unreachable!() }
        pub unsafe fn w_mepc(_: usize) { unreachable!() }
        pub unsafe fn w_medeleg(_: usize) { unreachable!() }
        pub unsafe fn w_mideleg(_: usize) { unreachable!() }
        pub unsafe fn w_mcounteren(_: usize) { unreachable!() }
        pub fn r_mcounteren() -> usize { unreachable!() }
        pub unsafe fn w_sepc(_: usize) { unreachable!() }
        pub fn r_sepc() -> usize { unreachable!() }
        pub unsafe fn w_stvec(_: usize) { unreachable!() }
        pub unsafe fn w_satp(_: usize) { unreachable!() }
        pub fn r_satp() -> usize { unreachable!() }
        pub fn r_scause() -> usize { unreachable!() }
        pub fn r_stval() -> usize { unreachable!() }
        pub fn r_time() -> usize { unreachable!() }
        pub unsafe fn w_stimecmp(_: usize) { unreachable!() }
        pub fn r_tp() -> usize { unreachable!() }
        pub unsafe fn w_tp(_: usize) { unreachable!() }
        pub unsafe fn sfence_vma() { unreachable!() }
        pub fn wfi() { unreachable!() }
        pub unsafe fn intr_on() { unreachable!() }
        pub fn intr_off() { unreachable!() }
        pub fn intr_get() -> bool { unreachable!() }
    }
}

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    pub struct PteFlags: usize {
        /// Valid.
        const V = (1) << 0;
        const R = (1) << 1;
        const W = (1) << 2;
        const X = (1) << 3;
        /// User can access.
        const U = (1) << 4;
    }
}

/// Shift a physical address to the right place for a PTE.
pub const fn pa2pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

pub const fn pte2pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

/// Extract one of the three 9-bit page-table indices from a virtual address.
pub const PXMASK: usize = 0x1ff;

pub const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

pub const fn px(level: usize, va: usize) -> usize {
    (va >> pxshift(level)) & PXMASK
}

/// One beyond the highest possible virtual address. MAXVA is actually one
/// bit less than the max allowed by Sv39 to avoid having to sign-extend
/// virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Use riscv's Sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

pub const fn make_satp(pagetable: usize) -> usize {
    SATP_SV39 | (pagetable >> 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pgroundup(0), 0);
        assert_eq!(pgroundup(1), PGSIZE);
        assert_eq!(pgroundup(PGSIZE), PGSIZE);
        assert_eq!(pgroundup(PGSIZE + 1), 2 * PGSIZE);
        assert_eq!(pgrounddown(PGSIZE - 1), 0);
        assert_eq!(pgrounddown(2 * PGSIZE + 7), 2 * PGSIZE);
    }

    #[test]
    fn pte_round_trips_page_aligned_pa() {
        let pa = 0x8020_3000;
        assert_eq!(pte2pa(pa2pte(pa)), pa);
    }

    #[test]
    fn px_extracts_each_level() {
        // va = L2 index 3, L1 index 5, L0 index 7, offset 9.
        let va = (3 << pxshift(2)) | (5 << pxshift(1)) | (7 << pxshift(0)) | 9;
        assert_eq!(px(2, va), 3);
        assert_eq!(px(1, va), 5);
        assert_eq!(px(0, va), 7);
    }

    #[test]
    fn maxva_is_two_to_the_38() {
        assert_eq!(MAXVA, 1 << 38);
    }
}
