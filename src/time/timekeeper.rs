//! Time sources are pluggable behind [`TimekeeperOps`], the same
//! highest-rated-candidate-that-inits-successfully pattern used for
//! interrupt controllers and scheduling policy. Exactly one "early" source
//! (HPET) is required at boot; a "late" source (TSC) is then given a chance
//! to take over once it can calibrate itself against the early one.
//!
//! Switching sources mid-flight must not move uptime backwards or jump it
//! forward, so the active source's ns-since-boot value at the moment of the
//! switch becomes the new source's zero point.

use core::sync::atomic::{AtomicU64, Ordering};

use conquer_once::spin::OnceCell;

use crate::time::{hpet, tsc};

pub struct TimekeeperOps {
    pub name: &'static str,
    pub rating: u32,
    /// Whether this source can be initialized before interrupts, APIC
    /// timers, or calibration against another source are available.
    pub early: bool,
    pub init: fn() -> bool,
    pub read_ticks: fn() -> u64,
    pub frequency_hz: fn() -> u64,
}

const CANDIDATES: &[&TimekeeperOps] = &[&hpet::OPS, &tsc::OPS];

static SELECTED: OnceCell<()> = OnceCell::uninit();
static ACTIVE: core::sync::atomic::AtomicPtr<TimekeeperOps> = core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

/// ns-since-boot the active source read `BASE_TICKS` of its own ticks at.
static BASE_NS: AtomicU64 = AtomicU64::new(0);
static BASE_TICKS: AtomicU64 = AtomicU64::new(0);

fn active() -> &'static TimekeeperOps {
    let ptr = ACTIVE.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "timekeeper not initialized");
    unsafe { &*ptr }
}

fn scale_ticks_to_ns(ticks: u64, freq_hz: u64) -> u64 {
    ((ticks as u128) * 1_000_000_000 / (freq_hz as u128)) as u64
}

fn switch_to(ops: &'static TimekeeperOps) {
    let now = if ACTIVE.load(Ordering::Acquire).is_null() { 0 } else { uptime_ns() };
    BASE_NS.store(now, Ordering::Release);
    BASE_TICKS.store((ops.read_ticks)(), Ordering::Release);
    ACTIVE.store(ops as *const TimekeeperOps as *mut TimekeeperOps, Ordering::Release);
    log::info!("timekeeper: switched to {} ({} Hz)", ops.name, (ops.frequency_hz)());
}

/// Select the best early source (must succeed) and then try to upgrade to
/// a late source. Called once, on the BSP.
pub fn init() {
    let mut best_early: Option<&'static TimekeeperOps> = None;
    for candidate in CANDIDATES {
        if candidate.early && (candidate.init)() {
            if best_early.map(|b| candidate.rating > b.rating).unwrap_or(true) {
                best_early = Some(candidate);
            }
        }
    }
    let early = best_early.expect("no usable early timekeeper found");
    switch_to(early);

    let mut best_late: Option<&'static TimekeeperOps> = None;
    for candidate in CANDIDATES {
        if !candidate.early && (candidate.init)() {
            if best_late.map(|b| candidate.rating > b.rating).unwrap_or(true) {
                best_late = Some(candidate);
            }
        }
    }
    if let Some(late) = best_late {
        if late.rating > early.rating {
            switch_to(late);
        }
    }

    SELECTED.try_init_once(|| ()).ok();
    crate::time::rtc::init();
}

/// Per-AP bring-up. The active source's state is already shared (HPET is
/// a single MMIO device; TSC's frequency was calibrated once on the BSP
/// and is assumed synchronized across cores), so there is nothing to
/// calibrate here today. Kept as a named hook because the original design
/// gives every CPU a chance to adjust its own offset, and a future
/// multi-socket target may need to use it.
pub fn init_this_cpu(_cpu_id: u32) {}

pub fn uptime_ns() -> u64 {
    let ops = active();
    let freq = (ops.frequency_hz)();
    if freq == 0 {
        return BASE_NS.load(Ordering::Acquire);
    }
    let ticks = (ops.read_ticks)().wrapping_sub(BASE_TICKS.load(Ordering::Acquire));
    BASE_NS.load(Ordering::Acquire) + scale_ticks_to_ns(ticks, freq)
}

pub fn uptime_us() -> u64 {
    uptime_ns() / 1000
}

pub fn uptime_secs_micros() -> (u64, u32) {
    let us = uptime_us();
    (us / 1_000_000, (us % 1_000_000) as u32)
}

/// Spin-wait for `ticks` raw cycles of the active source, with preemption
/// disabled. Used for the handful of hardware waits (PIT/PIC programming,
/// tight MMIO polling) that are too short to sleep through a schedule().
/// Aborts the kernel if the wait somehow exceeds five seconds, since that
/// almost certainly means the active source has stopped ticking.
pub fn stall_ns(ns: u64) {
    crate::per_cpu::preempt_disable();
    let start = uptime_ns();
    let deadline = start.saturating_add(ns);
    let fatal = start.saturating_add(5_000_000_000);
    loop {
        let now = uptime_ns();
        if now >= deadline {
            break;
        }
        if now >= fatal {
            panic!("timekeeper_stall exceeded 5s, active source {} appears stuck", active().name);
        }
        core::hint::spin_loop();
    }
    crate::per_cpu::preempt_enable();
}
