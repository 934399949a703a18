//! General-purpose, variable-size allocation (`kmalloc`/`kfree`) built on
//! top of the slab allocator. This is distinct from the crate's
//! `#[global_allocator]` (`linked_list_allocator`, installed over a region
//! carved out of the buddy allocator at boot): `kmalloc`/`kfree` are the
//! explicit kernel-internal entry points the spec's Heap component
//! describes, mirroring the original kernel's own `kmalloc`/`kfree` pair
//! rather than riding on Rust's `Box`/`Vec` path.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::memory::layout::PAGE_SIZE;
use crate::memory::slab::SlabCache;
use crate::memory::vmap::{self, MapFlags, Protection};
use crate::sync::spinlock::SpinLockIrq;

const ALIGN: usize = 16;
/// Requests at or above this footprint bypass slab pools entirely and are
/// served by a direct virtual mapping.
const DIRECT_THRESHOLD: usize = i16::MAX as usize;
/// A mempool is reused for a request if its object size falls within
/// `[total, total + SLACK]`.
const SLACK: usize = 48;
const CANARY_KEY: u64 = 0xDEAD_C0DE_FACE_BEEF;

#[repr(C)]
struct Header {
    total_size: usize,
    /// Index into the mempool registry, or `usize::MAX` for a direct
    /// (large) allocation.
    mempool: usize,
}

const DIRECT: usize = usize::MAX;

struct Mempool {
    cache: SlabCache,
    obj_total: usize,
    refcount: AtomicUsize,
    reclaim_pending: AtomicBool,
}

static MEMPOOLS: SpinLockIrq<Vec<Mempool>> = SpinLockIrq::new(Vec::new());

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

fn header_layout_size() -> usize {
    round_up(core::mem::size_of::<Header>(), ALIGN)
}

fn canary_for(payload: *mut u8) -> u64 {
    (payload as u64) ^ CANARY_KEY
}

fn find_or_create_mempool(total: usize) -> usize {
    {
        let pools = MEMPOOLS.lock();
        for (i, p) in pools.iter().enumerate() {
            if p.obj_total >= total && p.obj_total <= total + SLACK {
                p.refcount.fetch_add(1, Ordering::Relaxed);
                return i;
            }
        }
    }
    let cache = SlabCache::create(total, ALIGN, None, None);
    let mut pools = MEMPOOLS.lock();
    // Re-check under the lock in case of a concurrent creator.
    for (i, p) in pools.iter().enumerate() {
        if p.obj_total >= total && p.obj_total <= total + SLACK {
            p.refcount.fetch_add(1, Ordering::Relaxed);
            return i;
        }
    }
    pools.push(Mempool { cache, obj_total: total, refcount: AtomicUsize::new(1), reclaim_pending: AtomicBool::new(false) });
    pools.len() - 1
}

/// Allocate `n` bytes. Rounds up to 16, adds header + trailing 8-byte
/// canary, and routes below/above the direct-mapping threshold.
pub fn kmalloc(n: usize) -> Option<*mut u8> {
    let payload = round_up(n, ALIGN);
    let header_size = header_layout_size();
    let total = header_size + payload + 8;

    if total < DIRECT_THRESHOLD {
        let idx = find_or_create_mempool(total);
        let base = {
            let pools = MEMPOOLS.lock();
            pools[idx].cache.alloc()?
        };
        unsafe {
            (base as *mut Header).write(Header { total_size: total, mempool: idx });
            let payload_ptr = base.add(header_size);
            let canary_ptr = payload_ptr.add(payload) as *mut u64;
            canary_ptr.write_unaligned(canary_for(payload_ptr));
            Some(payload_ptr)
        }
    } else {
        let map_size = round_up(total, PAGE_SIZE as usize);
        let base = vmap::vmap(None, map_size as u64, Protection::READ | Protection::WRITE, MapFlags::ALLOC, None).ok()?;
        unsafe {
            let ptr = base.as_mut_ptr::<u8>();
            (ptr as *mut Header).write(Header { total_size: map_size, mempool: DIRECT });
            let payload_ptr = ptr.add(header_size);
            let canary_ptr = payload_ptr.add(payload) as *mut u64;
            canary_ptr.write_unaligned(canary_for(payload_ptr));
            Some(payload_ptr)
        }
    }
}

/// Verify the trailing canary and release the allocation. A tampered
/// canary is a fatal corruption, not a recoverable error.
pub fn kfree(payload: *mut u8) {
    let header_size = header_layout_size();
    let base = unsafe { payload.sub(header_size) };
    let header = unsafe { (base as *const Header).read() };
    let payload_size = header.total_size - header_size - 8;
    let canary_ptr = unsafe { payload.add(payload_size) as *const u64 };
    let observed = unsafe { canary_ptr.read_unaligned() };
    let expected = canary_for(payload);
    if observed != expected {
        panic!(
            "heap: canary mismatch at {:p} (expected {:#x}, found {:#x}) — corrupted allocation",
            payload, expected, observed
        );
    }

    if header.mempool == DIRECT {
        let _ = vmap::vunmap(x86_64::VirtAddr::new(base as u64), header.total_size as u64);
        return;
    }

    let last_ref = {
        let pools = MEMPOOLS.lock();
        let pool = &pools[header.mempool];
        pool.cache.free(base);
        pool.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    };
    if last_ref {
        schedule_reclaim(header.mempool);
    }
}

/// Enqueue (or perform immediately, pre-scheduler) delayed destruction of
/// an empty mempool.
fn schedule_reclaim(idx: usize) {
    if !crate::task::scheduler::is_running() {
        reclaim_mempool(idx);
        return;
    }
    let pools = MEMPOOLS.lock();
    if pools[idx].reclaim_pending.swap(true, Ordering::AcqRel) {
        return; // already queued
    }
    drop(pools);
    crate::task::workqueue::add(reclaim_work, idx as u64);
}

fn reclaim_work(arg: u64) {
    reclaim_mempool(arg as usize);
}

fn reclaim_mempool(idx: usize) {
    // Grace period: let any allocation racing ahead of the refcount drop
    // land first. A real grace interval would be a timed sleep; since this
    // may also run pre-scheduler, keep it a bounded stall instead.
    crate::time::stall_usec(1000);
    let pools = MEMPOOLS.lock();
    if let Some(pool) = pools.get(idx) {
        pool.reclaim_pending.store(false, Ordering::Release);
        if pool.refcount.load(Ordering::Acquire) == 0 {
            let _ = pool.cache.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_aligned() {
        assert_eq!(header_layout_size() % ALIGN, 0);
    }

    #[test]
    fn canary_depends_on_address() {
        let a = 0x1000 as *mut u8;
        let b = 0x2000 as *mut u8;
        assert_ne!(canary_for(a), canary_for(b));
    }
}
