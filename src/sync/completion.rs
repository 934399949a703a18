//! One-shot completion: a fast path that only reads a `done` flag with
//! acquire ordering, and a slow path that takes the waiter-list lock,
//! rechecks `done`, and parks if it is still unset.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::spinlock::SpinLockIrq;
use crate::task::scheduler::{self, SleepFlags};

pub struct Completion {
    done: AtomicBool,
    waiters: SpinLockIrq<VecDeque<u64>>,
}

impl Completion {
    pub const fn new() -> Self {
        Completion { done: AtomicBool::new(false), waiters: SpinLockIrq::new(VecDeque::new()) }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let tid = scheduler::current_thread_id();
        loop {
            {
                let mut waiters = self.waiters.lock();
                if self.done.load(Ordering::Acquire) {
                    return;
                }
                waiters.push_back(tid);
            }
            scheduler::sched_prepare_sleep(0, SleepFlags::empty());
            scheduler::schedule();
            if self.done.load(Ordering::Acquire) {
                return;
            }
        }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
        let mut waiters = self.waiters.lock();
        while let Some(tid) = waiters.pop_front() {
            scheduler::sched_wakeup(tid, 0);
        }
    }

    pub fn complete_all(&self) {
        self.complete();
    }

    pub fn reset(&self) {
        self.done.store(false, Ordering::Release);
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
