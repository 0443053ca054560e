use core::arch::{asm, global_asm};

use riscv::register::{
    mcounteren,
    medeleg::{self, Medeleg},
    mepc, mhartid,
    mideleg::{self, Mideleg},
    mie, mstatus, pmpaddr0, pmpcfg0,
    satp::{self, Satp},
    scounteren, sie,
};

use crate::{cpu, main, param::NCPU};

/// Boot stack size per hart.
pub const STACK_SIZE: usize = 4 * 4096;

#[repr(align(16))]
pub struct Stack0(pub [u8; STACK_SIZE * NCPU]);

/// One boot stack per hart.
pub static mut STACK0: Stack0 = Stack0([0; STACK_SIZE * NCPU]);

// qemu jumps here in machine mode with the hart id in mhartid.
global_asm!(
    ".section .text._entry",
    ".global _entry",
    "_entry:",
    // sp = STACK0 + (mhartid + 1) * STACK_SIZE
    "la sp, {stack0}",
    "li a0, {stack_size}",
    "csrr a1, mhartid",
    "addi a1, a1, 1",
    "mul a0, a0, a1",
    "add sp, sp, a0",
    "call {start}",
    "1: j 1b",
    stack0 = sym STACK0,
    stack_size = const STACK_SIZE,
    start = sym start,
);

// _entry jumps here in machine mode on STACK0.
extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    unsafe {
        mstatus::set_mpp(mstatus::MPP::Supervisor);
    }

    // set M Exception Program Counter to main, for mret.
    unsafe {
        mepc::write(main as usize);
    }

    // disable paging for now.
    unsafe {
        satp::write(Satp::from_bits(0));
    }

    // delegate all interrupts and exceptions to supervisor mode.
    unsafe {
        medeleg::write(Medeleg::from_bits(0xffff));
        mideleg::write(Mideleg::from_bits(0xffff));
        let mut sie = sie::read();
        sie.set_sext(true);
        sie.set_stimer(true);
        sie.set_ssoft(true);
        sie::write(sie);
    }

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    unsafe {
        pmpaddr0::write(0x3f_ffff_ffff_ffff);
        pmpcfg0::write(0xf);
    }

    // ask for clock interrupts.
    timer_init();

    // keep each hart's id in its tp register, for cpu::id().
    let id = mhartid::read();
    unsafe {
        cpu::set_id(id);
    }

    unsafe {
        asm!("mret", options(noreturn));
    }
}

/// Arranges to receive timer interrupts in supervisor mode.
///
/// They arrive as stimecmp expirations; the trap handler re-arms the
/// comparator on each tick.
fn timer_init() {
    // enable supervisor-mode timer interrupts.
    unsafe {
        mie::set_stimer();
    }

    // enable the sstc extension (i.e. stimecmp).
    unsafe {
        asm!("csrs menvcfg, {}", in(reg) 1_u64 << 63);
    }

    // allow supervisor to use stimecmp and time.
    unsafe {
        mcounteren::set_tm();
    }
    // allow user to read time.
    unsafe {
        scounteren::set_tm();
    }

    // ask for the very first timer interrupt.
    unsafe {
        let time: u64;
        asm!("csrr {}, time", out(reg) time);
        asm!("csrw stimecmp, {}", in(reg) time);
    }
}
