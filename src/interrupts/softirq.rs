//! Softirqs: the low-priority half of interrupt handling. A hardware ISR
//! does the minimum needed to acknowledge the device and defers the rest
//! by setting a bit in the per-CPU pending mask (`per_cpu::raise_softirq`);
//! `do_pending` is run with interrupts enabled, on the way out of the
//! outermost hardware interrupt, and actually executes the registered
//! handlers for whatever bits are set.

use core::sync::atomic::{AtomicPtr, Ordering};

pub const SOFTIRQ_TIMER: u32 = 0;
pub const SOFTIRQ_WORKQUEUE: u32 = 1;
const MAX_SOFTIRQS: usize = 32;

/// Bounds the "handler re-raised itself" loop in [`do_pending`]: beyond
/// this many passes in one call, whatever is still pending is deferred to
/// the next IRQ exit rather than starving the thread that got interrupted.
const MAX_PASSES: u32 = 8;

type Handler = fn();

static HANDLERS: [AtomicPtr<()>; MAX_SOFTIRQS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_SOFTIRQS];

/// Bind `handler` to `bit`. Not meant to be called concurrently with
/// itself; every softirq is registered once, during boot.
pub fn register(bit: u32, handler: Handler) {
    HANDLERS[bit as usize].store(handler as *mut (), Ordering::Release);
}

/// Mark `bit` pending on the calling CPU. Safe to call from interrupt
/// context; the actual handler runs later, out of `do_pending`.
pub fn raise(bit: u32) {
    crate::per_cpu::raise_softirq(bit);
}

fn run_pending_once(mut mask: u32) {
    while mask != 0 {
        let bit = mask.trailing_zeros();
        mask &= !(1 << bit);
        let ptr = HANDLERS[bit as usize].load(Ordering::Acquire);
        if !ptr.is_null() {
            let f: Handler = unsafe { core::mem::transmute(ptr) };
            f();
        }
    }
}

/// Drain every pending softirq on the calling CPU, re-checking for newly
/// raised bits (a handler running with interrupts enabled can itself
/// raise another) up to [`MAX_PASSES`] times.
pub fn do_pending() {
    for _ in 0..MAX_PASSES {
        let mask = crate::per_cpu::take_pending_softirqs();
        if mask == 0 {
            return;
        }
        run_pending_once(mask);
    }
    // Still pending after MAX_PASSES: let the next IRQ exit take another
    // crack at it instead of looping here indefinitely.
}

fn timer_softirq() {
    crate::task::scheduler::sched_tick();
}

/// Register the built-in softirqs. Called once, on the BSP, during
/// interrupt subsystem bring-up.
pub fn init() {
    register(SOFTIRQ_TIMER, timer_softirq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn bump() {
        HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn registered_handler_runs_once_per_pending_bit() {
        register(5, bump);
        let before = HITS.load(Ordering::Relaxed);
        run_pending_once(1 << 5);
        assert_eq!(HITS.load(Ordering::Relaxed), before + 1);
    }
}
