//! The riscv Platform Level Interrupt Controller (PLIC).

use crate::cpu::cpuid;
use crate::memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ};

/// Set the desired IRQ priorities non-zero (otherwise disabled).
///
/// # Safety
///
/// Must run once at boot, before interrupts are enabled.
pub unsafe fn plicinit() {
    unsafe {
        *((PLIC + UART0_IRQ * 4) as *mut u32) = 1;
        *((PLIC + VIRTIO0_IRQ * 4) as *mut u32) = 1;
    }
}

/// Ask the PLIC to deliver the devices' interrupts to this hart.
///
/// # Safety
///
/// Must run once per hart at boot.
pub unsafe fn plicinithart() {
    let hart = cpuid();

    unsafe {
        // Set the enable bits for this hart's S-mode.
        *(plic_senable(hart) as *mut u32) = (1 << UART0_IRQ) | (1 << VIRTIO0_IRQ);

        // Set this hart's S-mode priority threshold to 0.
        *(plic_spriority(hart) as *mut u32) = 0;
    }
}

/// Ask the PLIC what interrupt we should serve.
pub fn claim() -> u32 {
    let hart = cpuid();
    // SAFETY: the claim register is mapped and reads have no side effect
    // beyond claiming the IRQ, which is the point.
    unsafe { *(plic_sclaim(hart) as *mut u32) }
}

/// Tell the PLIC we've served this IRQ.
pub fn complete(irq: u32) {
    let hart = cpuid();
    // SAFETY: the claim/complete register is mapped; writing the IRQ number
    // re-enables its delivery.
    unsafe { *(plic_sclaim(hart) as *mut u32) = irq };
}
