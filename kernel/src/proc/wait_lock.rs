use core::cell::UnsafeCell;

use crate::sync::{SpinLock, SpinLockGuard};

use super::Proc;

pub(super) struct WaitLock {}

/// Serializes parent/child bookkeeping so wakeups of wait()ing parents
/// are not lost.
///
/// Must be acquired before any process lock.
static WAIT_LOCK: SpinLock<WaitLock> = SpinLock::new(WaitLock {});

pub(super) fn lock() -> SpinLockGuard<'static, WaitLock> {
    WAIT_LOCK.lock()
}

/// A process's parent link, readable and writable only under
/// [`WAIT_LOCK`].
pub(super) struct Parent {
    parent: UnsafeCell<Option<&'static Proc>>,
}

unsafe impl Sync for Parent {}

impl Parent {
    pub(super) const fn new() -> Self {
        Self {
            parent: UnsafeCell::new(None),
        }
    }

    pub(super) fn get(&self, _wait_lock: &mut SpinLockGuard<'_, WaitLock>) -> Option<&'static Proc> {
        unsafe { *self.parent.get() }
    }

    pub(super) fn set(
        &self,
        parent: Option<&'static Proc>,
        _wait_lock: &mut SpinLockGuard<'_, WaitLock>,
    ) {
        unsafe {
            *self.parent.get() = parent;
        }
    }

    /// Clears the link without the wait lock.
    ///
    /// # Safety
    ///
    /// Only the process-slot free path may call this; the slot is
    /// unreachable from any other process at that point.
    pub(super) unsafe fn reset(&self) {
        unsafe {
            *self.parent.get() = None;
        }
    }
}
