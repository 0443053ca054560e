use core::{
    arch::{asm, naked_asm},
    mem::offset_of,
};

use crate::{
    cpu::{self, Cpu},
    interrupt,
    sync::SpinLockGuard,
};

use super::{PROC, ProcSharedData, ProcState};

/// Saved registers for kernel context switches.
///
/// switch() only touches callee-saved registers: the caller-saved ones
/// are already on the kernel stack.
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,

    // callee-saved
    s0: u64,
    s1: u64,
    s2: u64,
    s3: u64,
    s4: u64,
    s5: u64,
    s6: u64,
    s7: u64,
    s8: u64,
    s9: u64,
    s10: u64,
    s11: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::zeroed();
    }
}

/// Per-hart scheduler loop; never returns.
///
/// Each hart calls this after setting itself up. The loop:
///
/// - picks a runnable process,
/// - switches to it,
/// - eventually the process switches back, via sched().
pub fn schedule() -> ! {
    let cpu = Cpu::current();
    cpu.set_proc(None);

    loop {
        // The most recent process to run may have had interrupts
        // turned off; enable them to avoid a deadlock if every
        // process is waiting for a device.
        interrupt::enable();

        let mut found = false;
        for p in &PROC {
            let mut shared = p.shared().lock();
            if shared.state != ProcState::Runnable {
                continue;
            }

            // Switch to the chosen process. It is the process's job to
            // release its lock and reacquire it before jumping back.
            shared.state = ProcState::Running;
            cpu.set_proc(Some(p.into()));
            unsafe { switch(cpu.context.get(), &raw const shared.context) };

            // The process is done running for now; it changed its own
            // state before coming back.
            cpu.set_proc(None);
            found = true;
            drop(shared);
        }

        if !found {
            // nothing to run; wait for an interrupt.
            interrupt::enable();
            unsafe { asm!("wfi") };
        }
    }
}

/// Switches to this hart's scheduler context.
///
/// The caller must hold exactly its own process lock, with interrupts
/// disabled and the process state already changed away from Running.
///
/// Saves and restores the saved interrupt-enable flag because it is a
/// property of this kernel thread, not of the hart.
pub fn sched(shared: &mut SpinLockGuard<'_, ProcSharedData>) {
    assert_eq!(interrupt::disabled_depth(), 1, "sched with locks held");
    assert_ne!(shared.state, ProcState::Running, "sched of running process");
    assert!(!interrupt::is_enabled(), "sched interruptible");

    let was_enabled = interrupt::was_enabled_before_push();
    unsafe {
        let cpu = Cpu::current();
        switch(&raw mut shared.context, cpu.context.get());
    }
    unsafe {
        interrupt::force_set_before_push(was_enabled);
    }
}

/// Saves the current registers in `old` and loads them from `new`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "sd ra, {c_ra}(a0)",
        "sd sp, {c_sp}(a0)",
        "sd s0, {c_s0}(a0)",
        "sd s1, {c_s1}(a0)",
        "sd s2, {c_s2}(a0)",
        "sd s3, {c_s3}(a0)",
        "sd s4, {c_s4}(a0)",
        "sd s5, {c_s5}(a0)",
        "sd s6, {c_s6}(a0)",
        "sd s7, {c_s7}(a0)",
        "sd s8, {c_s8}(a0)",
        "sd s9, {c_s9}(a0)",
        "sd s10, {c_s10}(a0)",
        "sd s11, {c_s11}(a0)",
        "ld ra, {c_ra}(a1)",
        "ld sp, {c_sp}(a1)",
        "ld s0, {c_s0}(a1)",
        "ld s1, {c_s1}(a1)",
        "ld s2, {c_s2}(a1)",
        "ld s3, {c_s3}(a1)",
        "ld s4, {c_s4}(a1)",
        "ld s5, {c_s5}(a1)",
        "ld s6, {c_s6}(a1)",
        "ld s7, {c_s7}(a1)",
        "ld s8, {c_s8}(a1)",
        "ld s9, {c_s9}(a1)",
        "ld s10, {c_s10}(a1)",
        "ld s11, {c_s11}(a1)",
        "ret",
        c_ra = const offset_of!(Context, ra),
        c_sp = const offset_of!(Context, sp),
        c_s0 = const offset_of!(Context, s0),
        c_s1 = const offset_of!(Context, s1),
        c_s2 = const offset_of!(Context, s2),
        c_s3 = const offset_of!(Context, s3),
        c_s4 = const offset_of!(Context, s4),
        c_s5 = const offset_of!(Context, s5),
        c_s6 = const offset_of!(Context, s6),
        c_s7 = const offset_of!(Context, s7),
        c_s8 = const offset_of!(Context, s8),
        c_s9 = const offset_of!(Context, s9),
        c_s10 = const offset_of!(Context, s10),
        c_s11 = const offset_of!(Context, s11),
    )
}
