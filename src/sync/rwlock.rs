//! Writer-preferring read-write spinlock: writers increment a waiters
//! counter before attempting to take the writer bit so that new readers back
//! off while a writer is pending, instead of starving it under read
//! pressure.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

const WRITER_BIT: usize = 1 << (usize::BITS - 1);

pub struct RwSpinLock<T> {
    state: AtomicUsize,
    writer_waiters: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(data: T) -> Self {
        RwSpinLock {
            state: AtomicUsize::new(0),
            writer_waiters: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> RwSpinLockReadGuard<'_, T> {
        crate::per_cpu::preempt_disable();
        loop {
            if self.writer_waiters.load(Ordering::Relaxed) > 0 {
                core::hint::spin_loop();
                continue;
            }
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER_BIT != 0 {
                core::hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwSpinLockReadGuard { lock: self };
            }
        }
    }

    pub fn write(&self) -> RwSpinLockWriteGuard<'_, T> {
        crate::per_cpu::preempt_disable();
        self.writer_waiters.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }
        self.writer_waiters.fetch_sub(1, Ordering::Relaxed);
        RwSpinLockWriteGuard { lock: self }
    }
}

pub struct RwSpinLockReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwSpinLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        crate::per_cpu::preempt_enable();
    }
}

pub struct RwSpinLockWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for RwSpinLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwSpinLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        crate::per_cpu::preempt_enable();
    }
}
