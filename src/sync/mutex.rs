//! A sleeping mutex: a unary counting semaphore plus owner tracking.
//! Reentrant locking by the holder is a detected bug (`bug_on!`), not a
//! recoverable error. Before the scheduler is initialized there is no
//! thread to park, so `lock`/`unlock` degrade to a bare spinlock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Errno;
use crate::sync::semaphore::Semaphore;
use crate::task::scheduler;

const NO_OWNER: u64 = u64::MAX;

pub struct Mutex<T> {
    sem: Semaphore,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex { sem: Semaphore::new(1), owner: AtomicU64::new(NO_OWNER), data: UnsafeCell::new(data) }
    }

    fn current_owner_id() -> u64 {
        if scheduler::is_running() {
            scheduler::current_thread_id()
        } else {
            // Before the scheduler exists there is exactly one execution
            // context (the boot CPU), so any nonzero sentinel works.
            0
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = Self::current_owner_id();
        crate::bug_on!(self.owner.load(Ordering::Relaxed) == me, "reentrant mutex lock");
        if scheduler::is_running() {
            self.sem.wait(false, 0).expect("non-interruptible wait cannot fail");
        } else {
            while self
                .owner
                .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            return MutexGuard { lock: self, degraded: true };
        }
        self.owner.store(me, Ordering::Release);
        MutexGuard { lock: self, degraded: false }
    }

    /// Sleep with a timeout; returns `Errno::TimedOut` if the mutex is not
    /// acquired within `timeout_ms`.
    pub fn lock_timed(&self, timeout_ms: u64) -> Result<MutexGuard<'_, T>, Errno> {
        let me = Self::current_owner_id();
        crate::bug_on!(self.owner.load(Ordering::Relaxed) == me, "reentrant mutex lock");
        self.sem.wait(true, timeout_ms)?;
        self.owner.store(me, Ordering::Release);
        Ok(MutexGuard { lock: self, degraded: false })
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = Self::current_owner_id();
        if self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { lock: self, degraded: !scheduler::is_running() })
        } else {
            None
        }
    }
}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
    degraded: bool,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Release);
        if !self.degraded {
            self.lock.sem.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(0u32);
        let g1 = m.try_lock().expect("first lock succeeds");
        assert!(m.try_lock().is_none());
        drop(g1);
        assert!(m.try_lock().is_some());
    }
}
