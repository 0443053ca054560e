//! Low-level code handling traps from user space into the kernel and
//! returns from kernel to user.
//!
//! The kernel maps the page holding this code at the same virtual
//! address (TRAMPOLINE) in user and kernel space so that it keeps
//! working across the page-table switch. kernel.ld places the
//! `trampsec` section on its own page.

use core::{arch::naked_asm, mem::offset_of};

use crate::{
    memory::{VirtAddr, layout::TRAMPOLINE},
    proc::TrapFrame,
};

pub fn user_vec_addr() -> VirtAddr {
    TRAMPOLINE
        .byte_add(user_vec as usize - trampoline as usize)
        .unwrap()
}

pub fn user_ret_addr() -> VirtAddr {
    TRAMPOLINE
        .byte_add(user_ret as usize - trampoline as usize)
        .unwrap()
}

/// Start-of-page marker; the trampoline page is mapped from here.
#[unsafe(naked)]
#[unsafe(link_section = "trampsec")]
pub extern "C" fn trampoline() {
    naked_asm!("")
}

/// Traps from user space start here, in supervisor mode but on the
/// user page table.
#[unsafe(naked)]
#[rustc_align(4)]
#[unsafe(link_section = "trampsec")]
pub extern "C" fn user_vec() {
    naked_asm!(
        // save user a0 in sscratch so a0 can point at TRAPFRAME.
        "csrw sscratch, a0",
        // each process has its own trap-frame page, but it is mapped at
        // the same virtual address in every user page table.
        "li a0, {trapframe}",
        // save the user registers.
        "sd ra, {tf_ra}(a0)",
        "sd sp, {tf_sp}(a0)",
        "sd gp, {tf_gp}(a0)",
        "sd tp, {tf_tp}(a0)",
        "sd t0, {tf_t0}(a0)",
        "sd t1, {tf_t1}(a0)",
        "sd t2, {tf_t2}(a0)",
        "sd s0, {tf_s0}(a0)",
        "sd s1, {tf_s1}(a0)",
        // not a0; it is in sscratch
        "sd a1, {tf_a1}(a0)",
        "sd a2, {tf_a2}(a0)",
        "sd a3, {tf_a3}(a0)",
        "sd a4, {tf_a4}(a0)",
        "sd a5, {tf_a5}(a0)",
        "sd a6, {tf_a6}(a0)",
        "sd a7, {tf_a7}(a0)",
        "sd s2, {tf_s2}(a0)",
        "sd s3, {tf_s3}(a0)",
        "sd s4, {tf_s4}(a0)",
        "sd s5, {tf_s5}(a0)",
        "sd s6, {tf_s6}(a0)",
        "sd s7, {tf_s7}(a0)",
        "sd s8, {tf_s8}(a0)",
        "sd s9, {tf_s9}(a0)",
        "sd s10, {tf_s10}(a0)",
        "sd s11, {tf_s11}(a0)",
        "sd t3, {tf_t3}(a0)",
        "sd t4, {tf_t4}(a0)",
        "sd t5, {tf_t5}(a0)",
        "sd t6, {tf_t6}(a0)",
        // save the user a0.
        "csrr t0, sscratch",
        "sd t0, {tf_a0}(a0)",
        // set up the kernel stack pointer and hart id.
        "ld sp, {tf_kernel_sp}(a0)",
        "ld tp, {tf_kernel_hartid}(a0)",
        // load the address of trap_user() and the kernel page table.
        "ld t0, {tf_kernel_trap}(a0)",
        "ld t1, {tf_kernel_satp}(a0)",
        // wait for any previous memory operations to complete, so that
        // they used the user page table.
        "sfence.vma zero, zero",
        // install the kernel page table.
        "csrw satp, t1",
        // flush now-stale user entries from the TLB.
        "sfence.vma zero, zero",
        // jump to trap_user(), which does not return.
        "jr t0",
        trapframe = const crate::memory::layout::TRAPFRAME.addr(),
        tf_kernel_satp = const offset_of!(TrapFrame, kernel_satp),
        tf_kernel_sp = const offset_of!(TrapFrame, kernel_sp),
        tf_kernel_trap = const offset_of!(TrapFrame, kernel_trap),
        tf_kernel_hartid = const offset_of!(TrapFrame, kernel_hartid),
        tf_ra = const offset_of!(TrapFrame, ra),
        tf_sp = const offset_of!(TrapFrame, sp),
        tf_gp = const offset_of!(TrapFrame, gp),
        tf_tp = const offset_of!(TrapFrame, tp),
        tf_t0 = const offset_of!(TrapFrame, t0),
        tf_t1 = const offset_of!(TrapFrame, t1),
        tf_t2 = const offset_of!(TrapFrame, t2),
        tf_s0 = const offset_of!(TrapFrame, s0),
        tf_s1 = const offset_of!(TrapFrame, s1),
        tf_a0 = const offset_of!(TrapFrame, a0),
        tf_a1 = const offset_of!(TrapFrame, a1),
        tf_a2 = const offset_of!(TrapFrame, a2),
        tf_a3 = const offset_of!(TrapFrame, a3),
        tf_a4 = const offset_of!(TrapFrame, a4),
        tf_a5 = const offset_of!(TrapFrame, a5),
        tf_a6 = const offset_of!(TrapFrame, a6),
        tf_a7 = const offset_of!(TrapFrame, a7),
        tf_s2 = const offset_of!(TrapFrame, s2),
        tf_s3 = const offset_of!(TrapFrame, s3),
        tf_s4 = const offset_of!(TrapFrame, s4),
        tf_s5 = const offset_of!(TrapFrame, s5),
        tf_s6 = const offset_of!(TrapFrame, s6),
        tf_s7 = const offset_of!(TrapFrame, s7),
        tf_s8 = const offset_of!(TrapFrame, s8),
        tf_s9 = const offset_of!(TrapFrame, s9),
        tf_s10 = const offset_of!(TrapFrame, s10),
        tf_s11 = const offset_of!(TrapFrame, s11),
        tf_t3 = const offset_of!(TrapFrame, t3),
        tf_t4 = const offset_of!(TrapFrame, t4),
        tf_t5 = const offset_of!(TrapFrame, t5),
        tf_t6 = const offset_of!(TrapFrame, t6),
    )
}

/// Switches from kernel to user: installs the user page table (in a0),
/// restores the user registers, and srets.
#[unsafe(naked)]
#[unsafe(link_section = "trampsec")]
pub extern "C" fn user_ret(satp: usize) {
    naked_asm!(
        // switch to the user page table.
        "sfence.vma zero, zero",
        "csrw satp, a0",
        "sfence.vma zero, zero",
        "li a0, {trapframe}",
        // restore all but a0.
        "ld ra, {tf_ra}(a0)",
        "ld sp, {tf_sp}(a0)",
        "ld gp, {tf_gp}(a0)",
        "ld tp, {tf_tp}(a0)",
        "ld t0, {tf_t0}(a0)",
        "ld t1, {tf_t1}(a0)",
        "ld t2, {tf_t2}(a0)",
        "ld s0, {tf_s0}(a0)",
        "ld s1, {tf_s1}(a0)",
        "ld a1, {tf_a1}(a0)",
        "ld a2, {tf_a2}(a0)",
        "ld a3, {tf_a3}(a0)",
        "ld a4, {tf_a4}(a0)",
        "ld a5, {tf_a5}(a0)",
        "ld a6, {tf_a6}(a0)",
        "ld a7, {tf_a7}(a0)",
        "ld s2, {tf_s2}(a0)",
        "ld s3, {tf_s3}(a0)",
        "ld s4, {tf_s4}(a0)",
        "ld s5, {tf_s5}(a0)",
        "ld s6, {tf_s6}(a0)",
        "ld s7, {tf_s7}(a0)",
        "ld s8, {tf_s8}(a0)",
        "ld s9, {tf_s9}(a0)",
        "ld s10, {tf_s10}(a0)",
        "ld s11, {tf_s11}(a0)",
        "ld t3, {tf_t3}(a0)",
        "ld t4, {tf_t4}(a0)",
        "ld t5, {tf_t5}(a0)",
        "ld t6, {tf_t6}(a0)",
        // restore user a0 last.
        "ld a0, {tf_a0}(a0)",
        // return to user mode and the user pc;
        // trap_user_ret() set up sstatus and sepc.
        "sret",
        trapframe = const crate::memory::layout::TRAPFRAME.addr(),
        tf_ra = const offset_of!(TrapFrame, ra),
        tf_sp = const offset_of!(TrapFrame, sp),
        tf_gp = const offset_of!(TrapFrame, gp),
        tf_tp = const offset_of!(TrapFrame, tp),
        tf_t0 = const offset_of!(TrapFrame, t0),
        tf_t1 = const offset_of!(TrapFrame, t1),
        tf_t2 = const offset_of!(TrapFrame, t2),
        tf_s0 = const offset_of!(TrapFrame, s0),
        tf_s1 = const offset_of!(TrapFrame, s1),
        tf_a0 = const offset_of!(TrapFrame, a0),
        tf_a1 = const offset_of!(TrapFrame, a1),
        tf_a2 = const offset_of!(TrapFrame, a2),
        tf_a3 = const offset_of!(TrapFrame, a3),
        tf_a4 = const offset_of!(TrapFrame, a4),
        tf_a5 = const offset_of!(TrapFrame, a5),
        tf_a6 = const offset_of!(TrapFrame, a6),
        tf_a7 = const offset_of!(TrapFrame, a7),
        tf_s2 = const offset_of!(TrapFrame, s2),
        tf_s3 = const offset_of!(TrapFrame, s3),
        tf_s4 = const offset_of!(TrapFrame, s4),
        tf_s5 = const offset_of!(TrapFrame, s5),
        tf_s6 = const offset_of!(TrapFrame, s6),
        tf_s7 = const offset_of!(TrapFrame, s7),
        tf_s8 = const offset_of!(TrapFrame, s8),
        tf_s9 = const offset_of!(TrapFrame, s9),
        tf_s10 = const offset_of!(TrapFrame, s10),
        tf_s11 = const offset_of!(TrapFrame, s11),
        tf_t3 = const offset_of!(TrapFrame, t3),
        tf_t4 = const offset_of!(TrapFrame, t4),
        tf_t5 = const offset_of!(TrapFrame, t5),
        tf_t6 = const offset_of!(TrapFrame, t6),
    )
}
