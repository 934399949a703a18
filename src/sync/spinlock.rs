//! Test-and-set spinlock integrated with the per-CPU preempt counter: taking
//! the lock disables preemption, releasing it re-enables preemption (which
//! may itself trigger a reschedule).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock { locked: AtomicBool::new(false), data: UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        crate::per_cpu::preempt_disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        crate::per_cpu::preempt_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            crate::per_cpu::preempt_enable();
            None
        }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        crate::per_cpu::preempt_enable();
    }
}

/// A spinlock that additionally disables interrupts for the duration of the
/// critical section, restoring the prior IF state on release. Required for
/// data shared with interrupt handlers.
pub struct SpinLockIrq<T> {
    inner: SpinLock<T>,
}

unsafe impl<T: Send> Send for SpinLockIrq<T> {}
unsafe impl<T: Send> Sync for SpinLockIrq<T> {}

impl<T> SpinLockIrq<T> {
    pub const fn new(data: T) -> Self {
        SpinLockIrq { inner: SpinLock::new(data) }
    }

    pub fn lock(&self) -> SpinLockIrqGuard<'_, T> {
        let was_enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        let guard = self.inner.lock();
        SpinLockIrqGuard { guard, restore: was_enabled }
    }
}

pub struct SpinLockIrqGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    restore: bool,
}

impl<'a, T> Deref for SpinLockIrqGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for SpinLockIrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for SpinLockIrqGuard<'a, T> {
    fn drop(&mut self) {
        if self.restore {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// Exercises lock/unlock against the per-CPU preempt counter. Touches the
/// GS-based per-CPU segment, so unlike the data-structure-only unit tests
/// elsewhere in this module tree it only runs under the in-kernel test
/// runner, not on the host.
#[cfg(feature = "testing")]
pub fn test_spinlock_preemption() {
    let lock = SpinLock::new(0u32);
    let before = crate::per_cpu::preempt_count();
    {
        let mut g = lock.lock();
        *g += 1;
        assert_eq!(crate::per_cpu::preempt_count(), before + 1);
    }
    assert_eq!(crate::per_cpu::preempt_count(), before);
    assert_eq!(*lock.lock(), 1);
}
