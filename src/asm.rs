//! The kernel's assembly collaborators: the boot entry, the kernel trap
//! vector, the user/kernel trampoline, and the context switch.
//!
//! The contracts these fulfil are described where they are consumed: the
//! trampoline's register layout in `proc::TrapFrame`, the context switch's
//! in `proc::Context`, and the entry/vector protocols in `start` and
//! `trap`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::global_asm;

        // qemu -kernel loads the kernel at 0x80000000 and causes each
        // hart to jump there. kernel.ld places this code at 0x80000000:
        // set up a per-hart boot stack and call start().
        global_asm!(
            r#"
            .section .text.entry
            .globl _entry
            _entry:
                la sp, stack0
                li a0, 4096
                csrr a1, mhartid
                addi a1, a1, 1
                mul a0, a0, a1
                add sp, sp, a0
                call start
            spin:
                j spin
            "#
        );

        // Interrupts and exceptions while in supervisor mode come here,
        // whatever the current kernel stack is. Push all registers, call
        // kerneltrap(), restore, return.
        global_asm!(
            r#"
            .section .text
            .globl kerneltrap
            .globl kernelvec
            .align 4
            kernelvec:
                addi sp, sp, -256
                sd ra, 0(sp)
                sd sp, 8(sp)
                sd gp, 16(sp)
                sd tp, 24(sp)
                sd t0, 32(sp)
                sd t1, 40(sp)
                sd t2, 48(sp)
                sd s0, 56(sp)
                sd s1, 64(sp)
                sd a0, 72(sp)
                sd a1, 80(sp)
                sd a2, 88(sp)
                sd a3, 96(sp)
                sd a4, 104(sp)
                sd a5, 112(sp)
                sd a6, 120(sp)
                sd a7, 128(sp)
                sd s2, 136(sp)
                sd s3, 144(sp)
                sd s4, 152(sp)
                sd s5, 160(sp)
                sd s6, 168(sp)
                sd s7, 176(sp)
                sd s8, 184(sp)
                sd s9, 192(sp)
                sd s10, 200(sp)
                sd s11, 208(sp)
                sd t3, 216(sp)
                sd t4, 224(sp)
                sd t5, 232(sp)
                sd t6, 240(sp)

                call kerneltrap

                ld ra, 0(sp)
                # not sp (in case we moved CPUs)
                ld gp, 16(sp)
                # not tp (in case we moved CPUs): it contains the hartid
                ld t0, 32(sp)
                ld t1, 40(sp)
                ld t2, 48(sp)
                ld s0, 56(sp)
                ld s1, 64(sp)
                ld a0, 72(sp)
                ld a1, 80(sp)
                ld a2, 88(sp)
                ld a3, 96(sp)
                ld a4, 104(sp)
                ld a5, 112(sp)
                ld a6, 120(sp)
                ld a7, 128(sp)
                ld s2, 136(sp)
                ld s3, 144(sp)
                ld s4, 152(sp)
                ld s5, 160(sp)
                ld s6, 168(sp)
                ld s7, 176(sp)
                ld s8, 184(sp)
                ld s9, 192(sp)
                ld s10, 200(sp)
                ld s11, 208(sp)
                ld t3, 216(sp)
                ld t4, 224(sp)
                ld t5, 232(sp)
                ld t6, 240(sp)
                addi sp, sp, 256
                sret
            "#
        );

        // Code to switch between user and kernel space, mapped at the same
        // virtual address (TRAMPOLINE, the highest page) in user and kernel
        // space so that it continues to work when it switches page tables.
        // kernel.ld places it on a page boundary.
        //
        // The trapframe lives at the fixed user virtual address TRAPFRAME =
        // 0x3fffffe000; that literal appears below because the address must
        // be materialized before the kernel page table (and its data) are
        // reachable.
        global_asm!(
            r#"
            .section trampsec
            .globl trampoline
            trampoline:
            .align 4
            .globl uservec
            uservec:
                # Traps from user space start here, in supervisor mode, but
                # with the user page table. Save user a0 in sscratch so a0
                # can point to the trapframe.
                csrw sscratch, a0
                li a0, 0x3fffffe000

                # Save the user registers in the trapframe.
                sd ra, 40(a0)
                sd sp, 48(a0)
                sd gp, 56(a0)
                sd tp, 64(a0)
                sd t0, 72(a0)
                sd t1, 80(a0)
                sd t2, 88(a0)
                sd s0, 96(a0)
                sd s1, 104(a0)
                sd a1, 120(a0)
                sd a2, 128(a0)
                sd a3, 136(a0)
                sd a4, 144(a0)
                sd a5, 152(a0)
                sd a6, 160(a0)
                sd a7, 168(a0)
                sd s2, 176(a0)
                sd s3, 184(a0)
                sd s4, 192(a0)
                sd s5, 200(a0)
                sd s6, 208(a0)
                sd s7, 216(a0)
                sd s8, 224(a0)
                sd s9, 232(a0)
                sd s10, 240(a0)
                sd s11, 248(a0)
                sd t3, 256(a0)
                sd t4, 264(a0)
                sd t5, 272(a0)
                sd t6, 280(a0)

                # Save the user a0 in p->trap_frame->a0.
                csrr t0, sscratch
                sd t0, 112(a0)

                # Initialize the kernel stack pointer from
                # p->trap_frame->kernel_sp.
                ld sp, 8(a0)

                # Make tp hold the current hartid, from
                # p->trap_frame->kernel_hartid.
                ld tp, 32(a0)

                # Load the address of usertrap(), from
                # p->trap_frame->kernel_trap.
                ld t0, 16(a0)

                # Fetch the kernel page table address, from
                # p->trap_frame->kernel_satp.
                ld t1, 0(a0)

                # Wait for any previous memory operations to complete, so
                # that they use the user page table.
                sfence.vma zero, zero

                # Install the kernel page table.
                csrw satp, t1

                # Flush now-stale user entries from the TLB.
                sfence.vma zero, zero

                # Jump to usertrap(), which does not return.
                jr t0

            .globl userret
            userret:
                # userret(pagetable)
                # Called by usertrapret() in trap.rs to switch from kernel
                # to user. a0: user page table for satp.

                # Switch to the user page table.
                sfence.vma zero, zero
                csrw satp, a0
                sfence.vma zero, zero

                li a0, 0x3fffffe000

                # Restore all but a0 from the trapframe.
                ld ra, 40(a0)
                ld sp, 48(a0)
                ld gp, 56(a0)
                ld tp, 64(a0)
                ld t0, 72(a0)
                ld t1, 80(a0)
                ld t2, 88(a0)
                ld s0, 96(a0)
                ld s1, 104(a0)
                ld a1, 120(a0)
                ld a2, 128(a0)
                ld a3, 136(a0)
                ld a4, 144(a0)
                ld a5, 152(a0)
                ld a6, 160(a0)
                ld a7, 168(a0)
                ld s2, 176(a0)
                ld s3, 184(a0)
                ld s4, 192(a0)
                ld s5, 200(a0)
                ld s6, 208(a0)
                ld s7, 216(a0)
                ld s8, 224(a0)
                ld s9, 232(a0)
                ld s10, 240(a0)
                ld s11, 248(a0)
                ld t3, 256(a0)
                ld t4, 264(a0)
                ld t5, 272(a0)
                ld t6, 280(a0)

                # Restore user a0.
                ld a0, 112(a0)

                # Return to user mode and user pc; usertrapret() set up
                # sstatus and sepc.
                sret
            "#
        );

        // Context switch: swtch(old, new). Save the current callee-saved
        // registers in old, load them from new.
        global_asm!(
            r#"
            .section .text
            .globl swtch
            swtch:
                sd ra, 0(a0)
                sd sp, 8(a0)
                sd s0, 16(a0)
                sd s1, 24(a0)
                sd s2, 32(a0)
                sd s3, 40(a0)
                sd s4, 48(a0)
                sd s5, 56(a0)
                sd s6, 64(a0)
                sd s7, 72(a0)
                sd s8, 80(a0)
                sd s9, 88(a0)
                sd s10, 96(a0)
                sd s11, 104(a0)

                ld ra, 0(a1)
                ld sp, 8(a1)
                ld s0, 16(a1)
                ld s1, 24(a1)
                ld s2, 32(a1)
                ld s3, 40(a1)
                ld s4, 48(a1)
                ld s5, 56(a1)
                ld s6, 64(a1)
                ld s7, 72(a1)
                ld s8, 80(a1)
                ld s9, 88(a1)
                ld s10, 96(a1)
                ld s11, 104(a1)

                ret
            "#
        );
    } else {
        // Inert substitutes so the crate links for host unit tests. None
        // of these are reachable from the tests.

        use crate::proc::Context;

        #[no_mangle]
        pub static mut trampoline: [u8; 0] = [];

        #[no_mangle]
        pub static mut uservec: [u8; 0] = [];

        #[no_mangle]
        pub static mut userret: [u8; 0] = [];

        #[no_mangle]
        pub extern "C" fn kernelvec() {
            unreachable!();
        }

        #[no_mangle]
        pub extern "C" fn swtch(_old: *mut Context, _new: *mut Context) {
            unreachable!();
        }
    }
}
