//! A CPU's run queue: the policy's ready bands, a sleeper list ordered by
//! wakeup time, and a zombie list drained by this CPU's reaper. One
//! instance per CPU, reached through `per_cpu::runqueue()`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::SpinLockIrq;
use crate::task::policy::{self, ReadyQueue};
use crate::task::thread::{self, SleepFlags, ThreadState};

/// Matches the width of `Topology::allowed`: one bit, one possible runqueue,
/// per CPU.
pub const MAX_CPUS: usize = 64;

pub struct RunQueue {
    pub cpu_id: u32,
    ready: ReadyQueue,
    /// `(wakeup_time_us, tid)`, kept sorted ascending by wakeup time.
    sleepers: SpinLockIrq<Vec<(u64, u64)>>,
    zombies: SpinLockIrq<VecDeque<u64>>,
    reaper_sem: Semaphore,
    idle_tid: AtomicU64,
    current_tid: AtomicU64,
    thread_count: AtomicU32,
}

impl RunQueue {
    pub const fn new(cpu_id: u32) -> Self {
        RunQueue {
            cpu_id,
            ready: ReadyQueue::new(),
            sleepers: SpinLockIrq::new(Vec::new()),
            zombies: SpinLockIrq::new(VecDeque::new()),
            reaper_sem: Semaphore::new(0),
            idle_tid: AtomicU64::new(0),
            current_tid: AtomicU64::new(0),
            thread_count: AtomicU32::new(0),
        }
    }

    pub fn set_idle(&self, tid: u64) {
        self.idle_tid.store(tid, Ordering::Release);
    }

    pub fn idle_tid(&self) -> u64 {
        self.idle_tid.load(Ordering::Acquire)
    }

    pub fn set_current(&self, tid: u64) {
        self.current_tid.store(tid, Ordering::Release);
    }

    pub fn current_tid(&self) -> u64 {
        self.current_tid.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Relaxed)
    }

    /// Attach a freshly created thread to this runqueue: give it its
    /// policy-private state and mark it READY. Does not enqueue it;
    /// callers that want it scheduled immediately call
    /// [`RunQueue::enqueue_ready`] next.
    pub fn attach(&self, tid: u64) {
        thread::with_thread(tid, |t| {
            if t.policy_priv.is_null() {
                t.policy_priv = (policy::active().alloc_priv)(t.priority);
            }
            t.cpu.store(self.cpu_id, Ordering::Release);
            t.set_state(ThreadState::Ready);
        });
        self.thread_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue_ready(&self, tid: u64) {
        let priority = thread::with_thread(tid, |t| {
            t.set_state(ThreadState::Ready);
            t.priority
        })
        .unwrap_or(policy::DEFAULT_PRIORITY);
        (policy::active().enqueue)(&self.ready, tid, priority);
    }

    pub fn pick_next(&self) -> Option<u64> {
        (policy::active().pick_next)(&self.ready)
    }

    pub fn ready_len(&self) -> u32 {
        self.ready.len()
    }

    /// Runs once per timer tick on behalf of the currently running thread;
    /// returns whether its quantum has expired.
    pub fn tick_current(&self) -> bool {
        let tid = self.current_tid();
        thread::with_thread(tid, |t| (policy::active().on_tick)(t.policy_priv)).unwrap_or(true)
    }

    /// Park `tid` until `wakeup_time_us` (boot-relative microseconds), or
    /// indefinitely if `wakeup_time_us` is `u64::MAX`. `flags` must be the
    /// same `SleepFlags` the caller already stashed on the thread via
    /// `set_sleep_flags`: `BLOCK` parks it `BLOCKED` rather than `SLEEPING`
    /// (§4.5), which `sched_tick` later keys its wakeup error off of.
    pub fn push_sleeper(&self, tid: u64, wakeup_time_us: u64, flags: SleepFlags) {
        thread::with_thread(tid, |t| {
            t.set_state(if flags.contains(SleepFlags::BLOCK) { ThreadState::Blocked } else { ThreadState::Sleeping });
            t.wakeup_time.store(wakeup_time_us, Ordering::Release);
        });
        let mut sleepers = self.sleepers.lock();
        let pos = sleepers.partition_point(|&(t, _)| t <= wakeup_time_us);
        sleepers.insert(pos, (wakeup_time_us, tid));
    }

    pub fn remove_sleeper(&self, tid: u64) -> bool {
        let mut sleepers = self.sleepers.lock();
        if let Some(pos) = sleepers.iter().position(|&(_, t)| t == tid) {
            sleepers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Pop every sleeper whose wakeup time has passed, in ascending order.
    pub fn expired_sleepers(&self, now_us: u64) -> Vec<u64> {
        let mut sleepers = self.sleepers.lock();
        let mut count = 0;
        while count < sleepers.len() && sleepers[count].0 <= now_us {
            count += 1;
        }
        sleepers.drain(0..count).map(|(_, tid)| tid).collect()
    }

    pub fn push_zombie(&self, tid: u64) {
        thread::with_thread(tid, |t| t.set_state(ThreadState::Zombie));
        self.zombies.lock().push_back(tid);
        self.thread_count.fetch_sub(1, Ordering::Relaxed);
        self.reaper_sem.signal();
    }

    /// Blocks the calling (reaper) thread until a zombie is available.
    pub fn wait_zombie(&self) -> u64 {
        loop {
            self.reaper_sem.wait(false, 0).expect("non-interruptible wait cannot fail");
            if let Some(tid) = self.zombies.lock().pop_front() {
                return tid;
            }
        }
    }
}

const NULL_RQ: AtomicPtr<RunQueue> = AtomicPtr::new(core::ptr::null_mut());
static REGISTRY: [AtomicPtr<RunQueue>; MAX_CPUS] = [NULL_RQ; MAX_CPUS];

/// Allocate this CPU's run queue and wire it into `per_cpu`. Leaked
/// deliberately: a CPU's run queue lives for the remainder of uptime.
pub fn init_for_cpu(cpu_id: u32) -> &'static RunQueue {
    let rq: &'static RunQueue = Box::leak(Box::new(RunQueue::new(cpu_id)));
    crate::per_cpu::set_runqueue(rq as *const RunQueue);
    REGISTRY[cpu_id as usize].store(rq as *const RunQueue as *mut RunQueue, Ordering::Release);
    rq
}

/// Look up another CPU's run queue, e.g. to enqueue a thread woken up by a
/// sleeper on a different CPU than the one signaling it.
pub fn for_cpu(cpu_id: u32) -> &'static RunQueue {
    let ptr = REGISTRY[cpu_id as usize].load(Ordering::Acquire);
    assert!(!ptr.is_null(), "runqueue for cpu {} not initialized", cpu_id);
    unsafe { &*ptr }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_sleepers_returns_only_elapsed_ones_in_order() {
        let rq = RunQueue::new(0);
        rq.push_sleeper(1, 50, SleepFlags::empty());
        rq.push_sleeper(2, 10, SleepFlags::empty());
        rq.push_sleeper(3, 30, SleepFlags::empty());
        let expired = rq.expired_sleepers(30);
        assert_eq!(expired, [2, 3]);
        assert!(rq.expired_sleepers(49).is_empty());
        assert_eq!(rq.expired_sleepers(50), [1]);
    }
}
