//! Out-of-memory notification for no-fail allocation requests: the buddy
//! allocator invokes this between retry rounds rather than giving up.

use core::sync::atomic::{AtomicU64, Ordering};

static ROUNDS: AtomicU64 = AtomicU64::new(0);

pub fn notify() {
    let round = ROUNDS.fetch_add(1, Ordering::Relaxed);
    if round % 64 == 0 {
        log::warn!("oom: no-fail allocation retrying (round {})", round);
    }
    core::hint::spin_loop();
}

pub fn rounds() -> u64 {
    ROUNDS.load(Ordering::Relaxed)
}
