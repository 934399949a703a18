//! Per-CPU data accessed through the GS segment base: current/idle thread
//! pointers, the preempt counter, the `need_resched` flag, and the pending
//! softirq bitmask. One block is allocated per CPU at AP bring-up and its
//! address is loaded into `GS_BASE` before the CPU leaves its bootstrap
//! routine, so every other module reaches it via `current()` rather than a
//! table indexed by CPU id.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

use crate::task::runqueue::RunQueue;
use crate::task::thread::Thread;

/// Bits 0..7 hold ordinary `preempt_disable` nesting, bits 8..15 softirq
/// nesting, bits 16..23 hardirq nesting — mirrors the teacher's layout so
/// a nonzero value in any band inhibits preemption the same way.
pub const PREEMPT_OFFSET: u32 = 1;
pub const SOFTIRQ_OFFSET: u32 = 1 << 8;
pub const HARDIRQ_OFFSET: u32 = 1 << 16;

#[repr(C, align(64))]
pub struct PerCpuData {
    pub cpu_id: u32,
    pub current_thread: *mut Thread,
    pub idle_thread: *mut Thread,
    pub preempt_count: AtomicU32,
    pub need_resched: AtomicU32,
    pub softirq_pending: AtomicU32,
    pub in_irq_nesting: AtomicU32,
    pub kernel_stack_top: AtomicU64,
    pub runqueue: *const RunQueue,
}

unsafe impl Send for PerCpuData {}
unsafe impl Sync for PerCpuData {}

impl PerCpuData {
    fn new(cpu_id: u32) -> Self {
        PerCpuData {
            cpu_id,
            current_thread: core::ptr::null_mut(),
            idle_thread: core::ptr::null_mut(),
            preempt_count: AtomicU32::new(0),
            need_resched: AtomicU32::new(0),
            softirq_pending: AtomicU32::new(0),
            in_irq_nesting: AtomicU32::new(0),
            kernel_stack_top: AtomicU64::new(0),
            runqueue: core::ptr::null(),
        }
    }
}

static BLOCK_COUNT: AtomicUsize = AtomicUsize::new(0);
static NR_CPUS: AtomicUsize = AtomicUsize::new(1);

/// Allocate and install the per-CPU block for the calling CPU. Must run once
/// per CPU, on that CPU, before anything touches `current()`. The block is
/// intentionally leaked: it lives for the remainder of the kernel's uptime.
pub fn init_this_cpu(cpu_id: u32) {
    let block: &'static mut PerCpuData = Box::leak(Box::new(PerCpuData::new(cpu_id)));
    unsafe {
        GsBase::write(VirtAddr::new(block as *mut _ as u64));
    }
    BLOCK_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn current() -> &'static PerCpuData {
    unsafe { &*(GsBase::read().as_u64() as *const PerCpuData) }
}

#[inline]
pub fn cpu_id() -> u32 {
    current().cpu_id
}

pub fn nr_cpus() -> usize {
    NR_CPUS.load(Ordering::Relaxed)
}

/// Whether `init_this_cpu` has run for at least one CPU. Lets early-boot
/// code (the panic handler, chiefly) tell whether `GsBase` actually points
/// at a real block before dereferencing it via [`current`].
pub fn is_initialized() -> bool {
    BLOCK_COUNT.load(Ordering::Relaxed) > 0
}

pub fn set_nr_cpus(n: usize) {
    NR_CPUS.store(n, Ordering::Relaxed);
}

#[inline]
pub fn preempt_disable() {
    current().preempt_count.fetch_add(PREEMPT_OFFSET, Ordering::Relaxed);
}

#[inline]
pub fn preempt_enable() {
    let prev = current().preempt_count.fetch_sub(PREEMPT_OFFSET, Ordering::Relaxed);
    debug_assert!(prev > 0, "preempt_count underflow");
    if prev - PREEMPT_OFFSET == 0 && need_resched() {
        crate::task::scheduler::preempt_check();
    }
}

#[inline]
pub fn preempt_count() -> u32 {
    current().preempt_count.load(Ordering::Relaxed)
}

pub fn add_preempt_offset(offset: u32) {
    current().preempt_count.fetch_add(offset, Ordering::Relaxed);
}

pub fn sub_preempt_offset(offset: u32) {
    current().preempt_count.fetch_sub(offset, Ordering::Relaxed);
}

#[inline]
pub fn need_resched() -> bool {
    current().need_resched.load(Ordering::Relaxed) != 0
}

pub fn set_need_resched() {
    current().need_resched.store(1, Ordering::Relaxed);
}

pub fn clear_need_resched() {
    current().need_resched.store(0, Ordering::Relaxed);
}

pub fn current_thread_ptr() -> *mut Thread {
    current().current_thread
}

/// # Safety
/// Caller must hold the owning runqueue's lock (or otherwise guarantee
/// exclusive access) when changing `current_thread`.
pub unsafe fn set_current_thread(t: *mut Thread) {
    let block = GsBase::read().as_u64() as *mut PerCpuData;
    (*block).current_thread = t;
}

pub fn idle_thread_ptr() -> *mut Thread {
    current().idle_thread
}

/// # Safety
/// Must run once, during this CPU's scheduler bootstrap.
pub unsafe fn set_idle_thread(t: *mut Thread) {
    let block = GsBase::read().as_u64() as *mut PerCpuData;
    (*block).idle_thread = t;
}

pub fn set_runqueue(rq: *const RunQueue) {
    let block = GsBase::read().as_u64() as *mut PerCpuData;
    unsafe { (*block).runqueue = rq };
}

pub fn runqueue() -> &'static RunQueue {
    unsafe { &*current().runqueue }
}

/// Entered once per nested hardware-interrupt level, on the way into the
/// common trap dispatch. Bumps `preempt_count` by [`HARDIRQ_OFFSET`] so
/// nothing downstream can block or be preempted while servicing an IRQ.
pub fn hardirq_enter() {
    current().in_irq_nesting.fetch_add(1, Ordering::Relaxed);
    add_preempt_offset(HARDIRQ_OFFSET);
}

/// The matching exit. Returns `true` once nesting has unwound back to the
/// outermost level, the signal for the trap dispatcher to drain softirqs
/// and consider a reschedule before returning to the interrupted context.
pub fn hardirq_exit() -> bool {
    sub_preempt_offset(HARDIRQ_OFFSET);
    current().in_irq_nesting.fetch_sub(1, Ordering::Relaxed) == 1
}

pub fn in_irq() -> bool {
    current().in_irq_nesting.load(Ordering::Relaxed) != 0
}

pub fn raise_softirq(bit: u32) {
    current().softirq_pending.fetch_or(1 << bit, Ordering::Relaxed);
}

pub fn take_pending_softirqs() -> u32 {
    current().softirq_pending.swap(0, Ordering::AcqRel)
}

pub fn re_raise_softirqs(mask: u32) {
    current().softirq_pending.fetch_or(mask, Ordering::Relaxed);
}
