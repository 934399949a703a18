//! The ISR slot table: one entry per interrupt vector. Slots 0..32 are
//! exception traps with built-in handlers; slots 32..256 are allocated on
//! demand from a free-list bitmap and can be registered, masked,
//! synchronized, and torn down safely under preemption.

use core::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

use crate::error::{Errno, KResult};
use crate::sync::completion::Completion;
use crate::sync::spinlock::SpinLockIrq;

pub const NUM_VECTORS: usize = 256;
pub const FIRST_DYNAMIC_VECTOR: usize = 32;

/// Sentinel `in_flight` value meaning "retiring": no new handler entries
/// are admitted, and `interrupt_synchronize` is waiting for the count to
/// reach exactly this value (i.e. every in-flight handler has left).
const RETIRING: i64 = i64::MIN;

pub type HandlerFn = fn(u8);

/// Controller-side operations bound to one hardware IRQ line.
#[derive(Clone, Copy)]
pub struct IrqOps {
    pub controller_irq: u32,
    pub eoi: Option<fn(u32)>,
    pub mask: Option<fn(u32, bool)>,
    pub detach: Option<fn(u32)>,
}

struct IsrSlot {
    handler: AtomicPtr<()>,
    in_flight: AtomicI64,
    irq: SpinLockIrq<Option<IrqOps>>,
    private: AtomicPtr<()>,
    allocated: core::sync::atomic::AtomicBool,
}

impl IsrSlot {
    const fn new() -> Self {
        IsrSlot {
            handler: AtomicPtr::new(core::ptr::null_mut()),
            in_flight: AtomicI64::new(0),
            irq: SpinLockIrq::new(None),
            private: AtomicPtr::new(core::ptr::null_mut()),
            allocated: core::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[repr(transparent)]
struct SlotArray([IsrSlot; NUM_VECTORS]);

// `IsrSlot::new` is const, so a const array initializer works despite
// `IsrSlot` not being `Copy`.
static SLOTS: SlotArray = SlotArray([const { IsrSlot::new() }; NUM_VECTORS]);

static FREE_BITMAP: SpinLockIrq<[u64; 4]> = SpinLockIrq::new([u64::MAX, u64::MAX, u64::MAX, u64::MAX]);

fn slot(vector: u8) -> &'static IsrSlot {
    &SLOTS.0[vector as usize]
}

/// Allocate a free vector from the dynamic pool (32..256).
pub fn alloc_vector() -> KResult<u8> {
    let mut bitmap = FREE_BITMAP.lock();
    for word in 0..4 {
        let masked = if word == 0 {
            bitmap[word] & !((1u64 << FIRST_DYNAMIC_VECTOR) - 1)
        } else {
            bitmap[word]
        };
        if masked != 0 {
            let bit = masked.trailing_zeros() as usize;
            bitmap[word] &= !(1u64 << bit);
            let vector = word * 64 + bit;
            slot(vector as u8).allocated.store(true, Ordering::Release);
            return Ok(vector as u8);
        }
    }
    Err(Errno::NoMem)
}

/// Withdraw a fixed vector (the local APIC timer, the two IPI vectors)
/// from the dynamic pool so `alloc_vector` never hands it out. Called
/// once, at boot, before anything else can race it.
pub fn reserve_vector(vector: u8) {
    let word = vector as usize / 64;
    let bit = vector as usize % 64;
    let mut bitmap = FREE_BITMAP.lock();
    bitmap[word] &= !(1u64 << bit);
    slot(vector).allocated.store(true, Ordering::Release);
}

pub fn free_vector(vector: u8) {
    let word = vector as usize / 64;
    let bit = vector as usize % 64;
    let mut bitmap = FREE_BITMAP.lock();
    bitmap[word] |= 1 << bit;
    slot(vector).allocated.store(false, Ordering::Release);
}

/// Bind `fn_` to `vector` and record the controller's IRQ binding; the
/// caller is responsible for calling the controller's own `install`.
pub fn register(vector: u8, fn_: HandlerFn, irq: IrqOps, masked: bool) {
    slot(vector).handler.store(fn_ as *mut (), Ordering::Release);
    *slot(vector).irq.lock() = Some(irq);
    if let Some(mask_op) = irq.mask {
        mask_op(irq.controller_irq, masked);
    }
}

pub fn set_private(vector: u8, ptr: *mut ()) {
    slot(vector).private.store(ptr, Ordering::Release);
}

pub fn private(vector: u8) -> *mut () {
    slot(vector).private.load(Ordering::Acquire)
}

/// Dispatch entry point: called by the common trap handler for every
/// non-exception vector after the preempt-count/nesting bookkeeping has
/// already run.
pub fn dispatch(vector: u8) {
    let s = slot(vector);

    let admitted = {
        let _guard = s.irq.lock();
        let current = s.in_flight.load(Ordering::Acquire);
        if current < 0 {
            false
        } else {
            s.in_flight.fetch_add(1, Ordering::AcqRel);
            true
        }
    };

    if admitted {
        let handler = s.handler.load(Ordering::Acquire);
        if handler.is_null() {
            log::warn!("isr: vector {} fired with no handler installed", vector);
        } else {
            let f: HandlerFn = unsafe { core::mem::transmute(handler) };
            f(vector);
        }
        s.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    if let Some(irq) = *s.irq.lock() {
        if let Some(eoi) = irq.eoi {
            eoi(irq.controller_irq);
        }
    }
}

/// Block new handler entries and wait until every in-flight handler has
/// left. After this returns, `dispatch` is a no-op for this vector until
/// [`allow_entry_if_synced`] reverses it.
pub fn synchronize(vector: u8) {
    let s = slot(vector);
    // Subtracting i64::MIN wraps the counter by exactly 2^63: a small
    // positive in-flight count becomes deeply negative (rejecting new
    // entries) while still a precise distance from the RETIRING bit
    // pattern. Each in-flight handler's ordinary `fetch_sub(1)` on exit
    // walks the counter the rest of the way there.
    s.in_flight.fetch_sub(i64::MIN, Ordering::AcqRel);
    while s.in_flight.load(Ordering::Acquire) != RETIRING {
        core::hint::spin_loop();
    }
}

pub fn allow_entry_if_synced(vector: u8) {
    let s = slot(vector);
    if s.in_flight.load(Ordering::Acquire) == RETIRING {
        s.in_flight.store(0, Ordering::Release);
    }
}

/// Mask the IRQ, synchronize, detach from the controller on the ISR's
/// target CPU via a workqueue item, and wait for that detach to finish.
pub fn unregister(vector: u8) {
    let irq = *slot(vector).irq.lock();
    if let Some(ops) = irq {
        if let Some(mask_op) = ops.mask {
            mask_op(ops.controller_irq, true);
        }
    }
    synchronize(vector);

    let done = alloc::sync::Arc::new(Completion::new());
    let done_for_work = done.clone();
    let vector_copy = vector;
    crate::task::workqueue::add_closure(alloc::boxed::Box::new(move || {
        if let Some(ops) = irq {
            if let Some(detach) = ops.detach {
                detach(ops.controller_irq);
            }
        }
        *slot(vector_copy).irq.lock() = None;
        done_for_work.complete();
    }));
    done.wait();

    slot(vector).handler.store(core::ptr::null_mut(), Ordering::Release);
    free_vector(vector);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_vector_stays_in_dynamic_range() {
        let v = alloc_vector().unwrap();
        assert!(v as usize >= FIRST_DYNAMIC_VECTOR);
        free_vector(v);
    }
}
