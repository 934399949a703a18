//! TLB shootdown. A mapping change is only ever locally visible until its
//! CPU flushes; other CPUs that may have cached the old translation are
//! brought up to date with an IPI broadcast.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use x86_64::instructions::tlb;
use x86_64::VirtAddr;

use crate::memory::layout::PAGE_SIZE;

/// Beyond this many pages, flushing is done by reloading CR3 rather than
/// issuing one invlpg per page.
const RANGE_FLUSH_THRESHOLD: u64 = 128;

static SHOOTDOWN_ADDR: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_SIZE: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_REMAINING: AtomicU32 = AtomicU32::new(0);

fn flush_range(addr: u64, size: u64) {
    if size / PAGE_SIZE > RANGE_FLUSH_THRESHOLD {
        tlb::flush_all();
        return;
    }
    let mut page = addr;
    while page < addr + size {
        tlb::flush(VirtAddr::new(page));
        page += PAGE_SIZE;
    }
}

/// Invoked by every other CPU's shootdown IPI handler.
pub fn handle_shootdown_ipi() {
    let addr = SHOOTDOWN_ADDR.load(Ordering::Acquire);
    let size = SHOOTDOWN_SIZE.load(Ordering::Acquire);
    flush_range(addr, size);
    SHOOTDOWN_REMAINING.fetch_sub(1, Ordering::AcqRel);
}

/// Flush `[addr, addr+size)` locally, and broadcast to every other CPU if
/// the scheduler is up and the range is either in the kernel half or the
/// current process has more than one thread.
pub fn shootdown(addr: u64, size: u64, affects_other_threads: bool) {
    let kernel_half = crate::memory::layout::is_kernel_address(VirtAddr::new(addr));
    let broadcast_needed = crate::task::scheduler::is_running() && (kernel_half || affects_other_threads);

    if broadcast_needed {
        let others = crate::per_cpu::nr_cpus().saturating_sub(1);
        if others > 0 {
            SHOOTDOWN_ADDR.store(addr, Ordering::Release);
            SHOOTDOWN_SIZE.store(size, Ordering::Release);
            SHOOTDOWN_REMAINING.store(others, Ordering::Release);
            crate::interrupts::controller::send_ipi_all_but_self(crate::interrupts::controller::Ipi::TlbShootdown);
            while SHOOTDOWN_REMAINING.load(Ordering::Acquire) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    flush_range(addr, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_range_stays_under_threshold() {
        assert!(PAGE_SIZE * 4 / PAGE_SIZE <= RANGE_FLUSH_THRESHOLD);
    }
}
