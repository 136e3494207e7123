//! Per-hart state.

use core::cell::UnsafeCell;
use core::ptr;

use array_macro::array;

use crate::{
    param::NCPU,
    proc::{Context, Proc},
    riscv::{intr_get, intr_off, intr_on, r_tp},
};

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *const Proc,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: u32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

// The `Cpu` struct of the current cpu can be mutated. To do so, we need to
// obtain mutable pointers to the elements from a shared reference of a
// `Cpus`. It requires interior mutability, so we use `UnsafeCell`.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

// SAFETY: each thread accesses only the cpu struct of the hart on which it
// runs, and only with interrupts disabled.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    /// Returns this CPU's cpu struct.
    ///
    /// It is safe to call this function with interrupts enabled, but the
    /// returned address may no longer be the current CPU's by the time it
    /// is used, since a timer interrupt can move the thread to another
    /// hart.
    pub fn current_raw(&self) -> *mut Cpu {
        self.0[cpuid()].get()
    }
}

/// Returns this CPU's ID.
///
/// It is safe to call this function with interrupts enabled, but the
/// returned id may not be the current CPU's by the time it is used.
pub fn cpuid() -> usize {
    r_tp()
}

/// Returns a raw pointer to the current CPU's `Cpu`.
pub fn current_raw() -> *mut Cpu {
    crate::kernel::kernel().cpus().current_raw()
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
///
/// # Safety
///
/// Must be balanced by a later `pop_off` on the same hart.
pub unsafe fn push_off() {
    let old = intr_get();
    intr_off();

    // SAFETY: interrupts are off, so only this thread touches this hart's
    // Cpu.
    let cpu = unsafe { &mut *current_raw() };
    if cpu.noff == 0 {
        cpu.interrupt_enabled = old;
    }
    cpu.noff += 1;
}

/// pop_off() should be paired with push_off(). See push_off().
///
/// # Safety
///
/// Must balance an earlier `push_off` on the same hart; may re-enable
/// interrupts.
pub unsafe fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");

    // SAFETY: interrupts are off.
    let cpu = unsafe { &mut *current_raw() };
    assert!(cpu.noff >= 1, "pop_off");
    cpu.noff -= 1;

    if cpu.noff == 0 && cpu.interrupt_enabled {
        // SAFETY: leaving the outermost critical section.
        unsafe { intr_on() };
    }
}
