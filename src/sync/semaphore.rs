//! Counting semaphore with a FIFO wait queue. `wait` decrements the count
//! then parks the caller if it goes negative; `signal` increments and wakes
//! the head waiter. Accepts an interruptible flag and a millisecond timeout
//! per the concurrency model's cancellation contract.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicI64, Ordering};

use crate::error::Errno;
use crate::sync::spinlock::SpinLockIrq;
use crate::task::scheduler::{self, SleepFlags};

pub struct Semaphore {
    count: AtomicI64,
    waiters: SpinLockIrq<VecDeque<u64>>,
}

impl Semaphore {
    pub const fn new(initial: i64) -> Self {
        Semaphore { count: AtomicI64::new(initial), waiters: SpinLockIrq::new(VecDeque::new()) }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Decrement the count; park the caller if it goes negative.
    /// `timeout_ms == 0` means wait indefinitely.
    pub fn wait(&self, interruptible: bool, timeout_ms: u64) -> Result<(), Errno> {
        if self.count.fetch_sub(1, Ordering::Acquire) > 0 {
            return Ok(());
        }

        let tid = scheduler::current_thread_id();
        self.waiters.lock().push_back(tid);

        // A semaphore wait is a blocking wait on a resource, not a plain
        // timed nap: BLOCK marks the thread BLOCKED (§4.5) and is what
        // makes a timeout here report -ETIMEDOUT rather than 0 (§8).
        let flags = SleepFlags::BLOCK | if interruptible { SleepFlags::INTERRUPTIBLE } else { SleepFlags::empty() };
        scheduler::sched_prepare_sleep(timeout_ms, flags);
        let err = scheduler::schedule();

        // Whether we were woken naturally (signal) or by timeout/interrupt,
        // remove ourselves from the wait list if we are still on it —
        // distinguishes "resource granted before timeout" from a spurious
        // wake per the concurrency model's cancellation contract.
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|&t| t == tid) {
            waiters.remove(pos);
            drop(waiters);
            // We never got the resource; undo our decrement.
            self.count.fetch_add(1, Ordering::Release);
            return match err {
                0 => Ok(()),
                e if e == Errno::TimedOut as i32 => Err(Errno::TimedOut),
                e if e == Errno::Intr as i32 => Err(Errno::Intr),
                _ => Ok(()),
            };
        }
        Ok(())
    }

    /// Increment the count and wake the head waiter, if any.
    pub fn signal(&self) {
        self.count.fetch_add(1, Ordering::Release);
        let head = self.waiters.lock().pop_front();
        if let Some(tid) = head {
            scheduler::sched_wakeup(tid, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_starts_at_initial_value() {
        let s = Semaphore::new(3);
        assert_eq!(s.count(), 3);
    }
}
