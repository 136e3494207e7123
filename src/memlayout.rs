//! Physical memory layout.
//!
//! qemu -machine virt is set up like this, based on qemu's
//! hw/riscv/virt.c:
//!
//! 00001000 -- boot ROM, provided by qemu
//! 02000000 -- CLINT
//! 0C000000 -- PLIC
//! 10000000 -- uart0
//! 10001000 -- virtio disk
//! 80000000 -- boot ROM jumps here in machine mode;
//!             -kernel loads the kernel here
//! unused RAM after 80000000.
//!
//! The kernel uses physical memory thus:
//! 80000000 -- entry, then kernel text and data
//! end      -- start of kernel page allocation area
//! PHYSTOP  -- end of RAM used by the kernel

use crate::param::KSTACKPAGES;
use crate::riscv::{MAXVA, PGSIZE};

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: usize = 10;

/// virtio mmio interface.
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: usize = 1;

/// qemu puts the platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0xc00_0000;

pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}

pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x201000 + hart * 0x2000
}

pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x201004 + hart * 0x2000
}

/// The kernel expects there to be RAM for use by the kernel and user pages
/// from physical address 0x80000000 to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Map the trampoline page to the highest address, in both user and kernel
/// space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// User memory layout. Address zero first:
///   text
///   original data and bss
///   fixed-size stack
///   expandable heap
///   ...
///   TRAPFRAME (p->trap_frame, used by the trampoline)
///   TRAMPOLINE (the same page as in the kernel)
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Map kernel stacks beneath the trampoline, two pages each, every stack
/// preceded by an invalid guard page.
pub const fn kstack(p: usize) -> usize {
    TRAMPOLINE - (p + 1) * (KSTACKPAGES + 1) * PGSIZE + PGSIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_stacks_leave_a_guard_page_between_slots() {
        // The top of stack i must sit one (unmapped) page below the bottom
        // of stack i - 1.
        let top0 = kstack(0) + KSTACKPAGES * PGSIZE;
        assert_eq!(top0, TRAMPOLINE);
        for p in 1..8 {
            let top = kstack(p) + KSTACKPAGES * PGSIZE;
            assert_eq!(top + PGSIZE, kstack(p - 1));
        }
    }
}
