//! Wall clock, monotonic uptime, and the pluggable timekeeper behind both.
//! `timekeeper` owns source selection (HPET early, TSC once calibrated);
//! `rtc` supplies the one-time wall-clock read at boot that lets `hpet`'s
//! or `tsc`'s tick count be turned into a real date later if anything asks.

pub mod hpet;
pub mod rtc;
pub mod timekeeper;
pub mod tsc;

pub use timekeeper::{stall_ns, uptime_ns, uptime_secs_micros, uptime_us};

/// Bring up the timekeeper and RTC. Called once, on the BSP, after the
/// memory subsystem (HPET needs `vmap::iomap`) but before the scheduler.
pub fn init() {
    timekeeper::init();
}

/// Per-AP bring-up hook; see [`timekeeper::init_this_cpu`].
pub fn init_this_cpu(cpu_id: u32) {
    timekeeper::init_this_cpu(cpu_id);
}

/// Convenience wrapper over [`stall_ns`] for the common microsecond case.
pub fn stall_usec(us: u64) {
    stall_ns(us.saturating_mul(1000));
}
