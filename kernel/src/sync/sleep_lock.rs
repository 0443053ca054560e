use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr,
};

use crate::proc::{self, ProcId};

use super::SpinLock;

/// Long-term lock state: held flag plus the holding pid (debugging).
struct Held {
    held: bool,
    holder: ProcId,
}

struct RawSleepLock {
    state: SpinLock<Held>,
}

impl RawSleepLock {
    const fn new() -> Self {
        Self {
            state: SpinLock::new(Held {
                held: false,
                holder: ProcId::INVALID,
            }),
        }
    }

    fn acquire(&self) {
        let mut state = self.state.lock();
        while state.held {
            state = proc::sleep(ptr::from_ref(self).addr(), state);
        }
        state.held = true;
        state.holder = proc::current_pid();
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        state.holder = ProcId::INVALID;
        drop(state);
        proc::wakeup(ptr::from_ref(self).addr());
    }
}

/// A lock that sleeps while waiting, so it may be held across disk I/O
/// and other long operations.
pub struct SleepLock<T> {
    lock: RawSleepLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSleepLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, sleeping until it is free.
    ///
    /// Must be called from process context.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock.acquire();
        SleepLockGuard { lock: self }
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

unsafe impl<T> Send for SleepLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SleepLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> block_cache::Lock for SleepLock<T> {
    type Data = T;
    type Guard<'a>
        = SleepLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: T) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}
