//! Pluggable scheduling policy. The runqueue only ever calls through the
//! active [`PolicyOps`] vtable — selected once at boot from `sched_policy`
//! on the command line — so a different policy can be dropped in without
//! touching `runqueue.rs` or `scheduler.rs`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::spinlock::SpinLockIrq;

pub const NUM_BANDS: usize = 32;
pub const DEFAULT_PRIORITY: u8 = 15;

/// Per-priority-band ready queues. Each band is FIFO; a thread's quantum
/// (ticks remaining before it yields to the next thread in its band) lives
/// in its policy-private allocation, not here.
pub struct ReadyQueue {
    bands: [SpinLockIrq<VecDeque<u64>>; NUM_BANDS],
    count: AtomicU32,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        ReadyQueue { bands: [const { SpinLockIrq::new(VecDeque::new()) }; NUM_BANDS], count: AtomicU32::new(0) }
    }

    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations the active policy provides. `enqueue`/`pick_next` own the
/// ready-queue bands directly; `on_tick` reports whether the current
/// thread's quantum has run out (i.e. a reschedule is due).
pub struct PolicyOps {
    pub name: &'static str,
    pub alloc_priv: fn(priority: u8) -> *mut u8,
    pub free_priv: fn(*mut u8),
    pub enqueue: fn(&ReadyQueue, tid: u64, priority: u8),
    pub pick_next: fn(&ReadyQueue) -> Option<u64>,
    pub on_tick: fn(priv_ptr: *mut u8) -> bool,
}

/// Per-thread round-robin state: ticks remaining in the current quantum.
/// Lower priority numbers are more urgent and get a longer quantum, same
/// convention as thread niceness elsewhere in this module.
struct RrPriv {
    quantum_left: AtomicU32,
}

fn rr_quantum_for(priority: u8) -> u32 {
    let band = priority.min((NUM_BANDS - 1) as u8) as u32;
    4 + (NUM_BANDS as u32 - band) / 2
}

fn rr_alloc_priv(priority: u8) -> *mut u8 {
    let b = Box::new(RrPriv { quantum_left: AtomicU32::new(rr_quantum_for(priority)) });
    Box::into_raw(b) as *mut u8
}

fn rr_free_priv(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(ptr as *mut RrPriv));
    }
}

fn rr_enqueue(rq: &ReadyQueue, tid: u64, priority: u8) {
    let band = priority.min((NUM_BANDS - 1) as u8) as usize;
    rq.bands[band].lock().push_back(tid);
    rq.count.fetch_add(1, Ordering::Relaxed);
}

fn rr_pick_next(rq: &ReadyQueue) -> Option<u64> {
    for band in rq.bands.iter() {
        let mut q = band.lock();
        if let Some(tid) = q.pop_front() {
            rq.count.fetch_sub(1, Ordering::Relaxed);
            return Some(tid);
        }
    }
    None
}

fn rr_on_tick(priv_ptr: *mut u8) -> bool {
    if priv_ptr.is_null() {
        return true;
    }
    let p = unsafe { &*(priv_ptr as *const RrPriv) };
    let prev = p.quantum_left.fetch_sub(1, Ordering::Relaxed);
    if prev <= 1 {
        p.quantum_left.store(0, Ordering::Relaxed);
        true
    } else {
        false
    }
}

pub static ROUND_ROBIN: PolicyOps = PolicyOps {
    name: "rr",
    alloc_priv: rr_alloc_priv,
    free_priv: rr_free_priv,
    enqueue: rr_enqueue,
    pick_next: rr_pick_next,
    on_tick: rr_on_tick,
};

static ACTIVE: conquer_once::spin::OnceCell<&'static PolicyOps> = conquer_once::spin::OnceCell::uninit();

/// Select the policy named on the command line (only `"rr"` exists at
/// present; anything else falls back to it with a warning).
pub fn init() {
    let name = crate::config::sched_policy();
    let chosen = match name {
        "rr" => &ROUND_ROBIN,
        other => {
            log::warn!("scheduler: unknown policy {:?}, defaulting to rr", other);
            &ROUND_ROBIN
        }
    };
    ACTIVE.try_init_once(|| chosen).ok();
}

pub fn active() -> &'static PolicyOps {
    ACTIVE.try_init_once(|| &ROUND_ROBIN).ok();
    *ACTIVE.get().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rr_quantum_favors_higher_priority() {
        assert!(rr_quantum_for(0) >= rr_quantum_for(31));
    }

    #[test]
    fn enqueue_then_pick_returns_same_tid() {
        let rq = ReadyQueue::new();
        rr_enqueue(&rq, 7, DEFAULT_PRIORITY);
        assert_eq!(rr_pick_next(&rq), Some(7));
        assert!(rq.is_empty());
    }

    #[test]
    fn on_tick_fires_once_quantum_exhausted() {
        let ptr = rr_alloc_priv(31);
        let mut fired = false;
        for _ in 0..8 {
            if rr_on_tick(ptr) {
                fired = true;
                break;
            }
        }
        assert!(fired);
        rr_free_priv(ptr);
    }
}
