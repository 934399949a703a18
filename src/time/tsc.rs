//! TSC: the late timekeeper. Cheaper to read than HPET's MMIO register and
//! far higher resolution, but only trustworthy once we know the CPU has an
//! invariant TSC and have calibrated its frequency against a source we
//! already trust — so it always comes up after HPET, never before it.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::time::hpet;
use crate::time::timekeeper::TimekeeperOps;

static FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);
static BASE_TICKS: AtomicU64 = AtomicU64::new(0);
static CALIBRATED: AtomicBool = AtomicBool::new(false);

/// Calibration window, measured against the HPET: long enough to average
/// out jitter in the read-the-reference-clock loop, short enough not to
/// stall boot noticeably.
const CALIBRATION_MS: u64 = 50;

#[inline(always)]
pub fn read_tsc() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        asm!("rdtsc", out("eax") low, out("edx") high, options(nostack, nomem, preserves_flags));
    }
    ((high as u64) << 32) | (low as u64)
}

/// `rdtsc` preceded by `lfence` so prior loads have retired, for use when
/// the exact instruction boundary the count was taken at matters (mostly
/// calibration).
#[inline(always)]
pub fn read_tsc_serialized() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        asm!("lfence", "rdtsc", out("eax") low, out("edx") high, options(nostack, nomem, preserves_flags));
    }
    ((high as u64) << 32) | (low as u64)
}

fn invariant_tsc() -> bool {
    let result = unsafe { core::arch::x86_64::__cpuid(0x8000_0007) };
    result.edx & (1 << 8) != 0
}

fn usable() -> bool {
    crate::config::tsc_enabled() && invariant_tsc()
}

fn init() -> bool {
    if !usable() {
        return false;
    }
    let ref_freq = hpet::frequency_hz();
    if ref_freq == 0 {
        return false;
    }

    let ref_ticks_target = ref_freq.saturating_mul(CALIBRATION_MS) / 1000;
    let ref_start = hpet::read_ticks();
    let tsc_start = read_tsc_serialized();

    let target = ref_start.saturating_add(ref_ticks_target);
    while hpet::read_ticks() < target {
        core::hint::spin_loop();
    }

    let tsc_end = read_tsc_serialized();
    let ref_end = hpet::read_ticks();

    let ref_elapsed = ref_end.saturating_sub(ref_start).max(1);
    let tsc_elapsed = tsc_end.saturating_sub(tsc_start);

    let elapsed_ns = (ref_elapsed as u128) * 1_000_000_000 / (ref_freq as u128);
    if elapsed_ns == 0 {
        return false;
    }
    let freq = ((tsc_elapsed as u128) * 1_000_000_000 / elapsed_ns) as u64;
    if freq == 0 {
        return false;
    }

    FREQUENCY_HZ.store(freq, Ordering::Release);
    BASE_TICKS.store(tsc_end, Ordering::Release);
    CALIBRATED.store(true, Ordering::Release);
    true
}

fn read_ticks() -> u64 {
    read_tsc().wrapping_sub(BASE_TICKS.load(Ordering::Relaxed))
}

fn frequency_hz() -> u64 {
    if CALIBRATED.load(Ordering::Relaxed) {
        FREQUENCY_HZ.load(Ordering::Relaxed)
    } else {
        0
    }
}

pub static OPS: TimekeeperOps = TimekeeperOps {
    name: "tsc",
    rating: 90,
    early: false,
    init,
    read_ticks,
    frequency_hz,
};
