use core::{arch::asm, cell::UnsafeCell, ptr::NonNull};

use crate::{
    interrupt,
    param::NCPU,
    proc::{Proc, scheduler::Context},
};

static CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];

/// Per-hart state.
pub struct Cpu {
    /// The process running on this hart, if any.
    proc: UnsafeCell<Option<NonNull<Proc>>>,
    /// switch() here to enter schedule().
    pub context: UnsafeCell<Context>,
    /// Depth of interrupt-disable nesting.
    pub noff: UnsafeCell<u32>,
    /// Were interrupts enabled before the first push?
    pub intena: UnsafeCell<bool>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: UnsafeCell::new(None),
            context: UnsafeCell::new(Context::zeroed()),
            noff: UnsafeCell::new(0),
            intena: UnsafeCell::new(false),
        }
    }

    /// Returns this hart's cpu struct.
    ///
    /// Interrupts must be disabled.
    pub fn current() -> &'static Self {
        assert!(!interrupt::is_enabled());
        &CPUS[id()]
    }

    pub fn set_proc(&self, p: Option<NonNull<Proc>>) {
        unsafe {
            *self.proc.get() = p;
        }
    }

    pub fn proc(&self) -> Option<NonNull<Proc>> {
        unsafe { *self.proc.get() }
    }
}

/// Returns the current hart's id.
///
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different hart.
pub fn id() -> usize {
    assert!(!interrupt::is_enabled());

    let id: usize;
    unsafe { asm!("mv {}, tp", out(reg) id) };
    id
}

/// Stores this hart's id in tp.
///
/// # Safety
///
/// Only the machine-mode boot path may call this.
pub unsafe fn set_id(id: usize) {
    unsafe {
        asm!("mv tp, {}", in(reg) id);
    }
}
