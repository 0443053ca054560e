use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{cpu::Cpu, interrupt, proc};

/// Mutual-exclusion lock without contents.
pub struct RawSpinLock {
    locked: AtomicBool,
    /// For debugging: the hart holding the lock.
    cpu: UnsafeCell<Option<&'static Cpu>>,
}

unsafe impl Sync for RawSpinLock {}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: UnsafeCell::new(None),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn acquire(&self) {
        // disable interrupts to avoid deadlock with interrupt handlers.
        // drop would re-enable interrupts, so forget the guard; release()
        // pops the nesting level instead.
        interrupt::push_disabled().forget();

        assert!(!self.holding(), "spinlock acquired twice on one hart");

        // Ordering::Acquire keeps the critical section's loads and
        // stores after this point. On RISC-V this emits a fence.
        while self.locked.swap(true, Ordering::Acquire) {}

        unsafe {
            *self.cpu.get() = Some(Cpu::current());
        }
    }

    /// Releases the lock.
    pub fn release(&self) {
        assert!(self.holding(), "released a spinlock not held");

        unsafe {
            *self.cpu.get() = None;
        }

        // Ordering::Release keeps the critical section's loads and
        // stores before this point, so they are visible to the next
        // holder. On RISC-V this emits a fence.
        self.locked.store(false, Ordering::Release);

        unsafe {
            interrupt::pop_disabled();
        }
    }

    /// Checks whether this hart is holding the lock.
    ///
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        assert!(!interrupt::is_enabled());
        self.locked.load(Ordering::Relaxed)
            && unsafe { *self.cpu.get() }.is_some_and(|c| ptr::eq(c, Cpu::current()))
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutual exclusion around a value of type `T`.
pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }

    /// Reconstructs the guard for a lock this hart already holds.
    ///
    /// # Safety
    ///
    /// The lock must be held by this hart with no live guard: the one
    /// case is a new process starting in forkret while the scheduler's
    /// acquisition is still outstanding.
    pub unsafe fn remember_locked(&self) -> SpinLockGuard<'_, T> {
        assert!(self.lock.holding());
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Returns the lock this guard came from, releasing it.
    pub fn into_lock(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }
}

impl<T> block_cache::Lock for SpinLock<T> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: T) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

/// A condition variable usable with any [`SpinLockGuard`].
///
/// Wakeups are broadcast; the generation counter makes waits robust
/// against spurious wakeups, but callers still re-test their own
/// predicate in a loop.
pub struct SpinLockCondVar {
    generation: AtomicU64,
}

impl SpinLockCondVar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    pub fn wait<'a, T>(&self, mut guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let seen = self.generation.load(Ordering::Relaxed);
        loop {
            guard = proc::sleep(ptr::from_ref(&self.generation).addr(), guard);
            if seen != self.generation.load(Ordering::Relaxed) {
                break;
            }
        }
        guard
    }

    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        proc::wakeup(ptr::from_ref(&self.generation).addr());
    }
}

impl Default for SpinLockCondVar {
    fn default() -> Self {
        Self::new()
    }
}
