//! Physical frame allocator: three zones (DMA ≤ 16 MiB, DMA32 ≤ 4 GiB,
//! NORMAL), each split into fixed-span *areas* that own a bitmap-encoded
//! buddy tree. A request for more frames than the hinted zone can supply
//! cascades to the next more permissive zone (NORMAL → DMA32 → DMA).

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex as SpinMutex;

use crate::memory::layout::{align_up, PAGE_SIZE};
use crate::sync::mutex::Mutex as SleepMutex;
use crate::sync::spinlock::SpinLockIrq;

pub const MAX_ORDER: u32 = 10; // 2^10 pages = 4 MiB, the largest single allocation.
/// Area span: each area covers this many pages at its top layer.
const AREA_ORDER: u32 = MAX_ORDER;
const AREA_PAGES: u64 = 1 << AREA_ORDER;
/// One area in roughly every 8 per zone is atomic-capable (usable from IRQ
/// context); the rest are sleep-mode and acquired under a mutex.
const ATOMIC_AREA_STRIDE: usize = 8;
const ALLOC_RETRY_BOUND: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZoneKind {
    Dma,
    Dma32,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AreaMode {
    Atomic,
    Sleep,
}

/// Bit `i` set means "node `i` (or something beneath it) is unavailable".
/// A fully-free block has its node bit and every descendant's bit clear.
struct BuddyBitmap {
    words: Vec<u64>,
    /// free block count per layer, layer 0 = whole-area node.
    free_count: Vec<usize>,
    max_order: u32,
}

impl BuddyBitmap {
    fn new(max_order: u32) -> Self {
        let total_nodes = (1usize << (max_order + 1)) - 1;
        let words = alloc::vec![0u64; (total_nodes + 63) / 64];
        let mut free_count = alloc::vec![0usize; max_order as usize + 1];
        // layer L (leaves, order 0) starts fully free: 2^L leaf blocks.
        free_count[max_order as usize] = 1usize << max_order;
        BuddyBitmap { words, free_count, max_order }
    }

    #[inline]
    fn layer_of(&self, order: u32) -> u32 {
        self.max_order - order
    }

    #[inline]
    fn layer_start(layer: u32) -> usize {
        (1usize << layer) - 1
    }

    fn get_bit(&self, idx: usize) -> bool {
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    fn set_bit(&mut self, idx: usize, v: bool) {
        let w = &mut self.words[idx / 64];
        if v {
            *w |= 1 << (idx % 64);
        } else {
            *w &= !(1u64 << (idx % 64));
        }
    }

    /// Word-wide scan for the first clear bit within a layer's node range.
    fn first_free_in_layer(&self, layer: u32) -> Option<usize> {
        let start = Self::layer_start(layer);
        let count = 1usize << layer;
        let end = start + count;
        let mut idx = start;
        while idx < end {
            let word_idx = idx / 64;
            let bit_in_word = idx % 64;
            let word = self.words[word_idx];
            let word_end_bit = core::cmp::min(64, end - word_idx * 64);
            let low_mask: u64 = if bit_in_word == 0 { 0 } else { (1u64 << bit_in_word) - 1 };
            let high_mask: u64 = if word_end_bit >= 64 { u64::MAX } else { (1u64 << word_end_bit) - 1 };
            let relevant_free = (!word) & high_mask & !low_mask;
            if relevant_free != 0 {
                let bit = relevant_free.trailing_zeros() as usize;
                return Some(word_idx * 64 + bit);
            }
            idx = (word_idx + 1) * 64;
        }
        None
    }

    /// Mark `idx` (at `layer`) and every descendant down to the leaf layer
    /// as unavailable.
    fn mark_subtree(&mut self, idx: usize, layer: u32, v: bool) {
        self.set_bit(idx, v);
        if layer == self.max_order {
            return;
        }
        let local = idx - Self::layer_start(layer);
        let child_layer = layer + 1;
        let left = Self::layer_start(child_layer) + local * 2;
        self.mark_subtree(left, child_layer, v);
        self.mark_subtree(left + 1, child_layer, v);
    }

    fn alloc(&mut self, order: u32) -> Option<usize> {
        let layer = self.layer_of(order);
        let idx = self.first_free_in_layer(layer)?;
        self.mark_subtree(idx, layer, true);
        self.free_count[layer as usize] = self.free_count[layer as usize].saturating_sub(1);
        // walk ancestors marking used; their own free_count bookkeeping is
        // layer-local so only the allocated layer's counter changes here.
        let mut cur = idx;
        let mut cur_layer = layer;
        while cur_layer > 0 {
            let local = cur - Self::layer_start(cur_layer);
            let parent_local = local / 2;
            cur_layer -= 1;
            cur = Self::layer_start(cur_layer) + parent_local;
            self.set_bit(cur, true);
        }
        Some(idx)
    }

    fn free(&mut self, order: u32, idx: usize) {
        let layer = self.layer_of(order);
        self.mark_subtree(idx, layer, false);
        self.free_count[layer as usize] += 1;
        let mut cur = idx;
        let mut cur_layer = layer;
        while cur_layer > 0 {
            let local = cur - Self::layer_start(cur_layer);
            let buddy_local = local ^ 1;
            let buddy_idx = Self::layer_start(cur_layer) + buddy_local;
            if self.get_bit(buddy_idx) {
                // buddy still allocated (or partially so): stop coalescing,
                // but the parent bit remains set because of the buddy.
                break;
            }
            let parent_local = local / 2;
            let parent_layer = cur_layer - 1;
            let parent_idx = Self::layer_start(parent_layer) + parent_local;
            self.set_bit(parent_idx, false);
            cur = parent_idx;
            cur_layer = parent_layer;
        }
    }

    /// Note: `free_count` is an approximate per-layer statistic only
    /// (coalescing on free doesn't retroactively correct every ancestor's
    /// count); allocation correctness instead re-derives availability from
    /// the bitmap directly via a scan.
    fn has_free(&self, order: u32) -> bool {
        self.first_free_in_layer(self.layer_of(order)).is_some()
    }

    /// Recompute every internal node as the OR of its two children, bottom
    /// up. Used once at boot after leaf bits have been set directly for
    /// reserved ranges, so ancestors correctly reflect "something beneath
    /// me is unavailable" without going through the alloc path.
    fn recompute_internal_nodes(&mut self) {
        let mut layer = self.max_order;
        while layer > 0 {
            let parent_layer = layer - 1;
            let parent_count = 1usize << parent_layer;
            for parent_local in 0..parent_count {
                let parent_idx = Self::layer_start(parent_layer) + parent_local;
                let left = Self::layer_start(layer) + parent_local * 2;
                let v = self.get_bit(left) || self.get_bit(left + 1);
                self.set_bit(parent_idx, v);
            }
            layer = parent_layer;
        }
        for l in 0..=self.max_order {
            let start = Self::layer_start(l);
            let count = 1usize << l;
            let mut free = 0usize;
            for i in start..start + count {
                if !self.get_bit(i) {
                    free += 1;
                }
            }
            self.free_count[l as usize] = free;
        }
    }
}

enum BitmapLock {
    Atomic(SpinLockIrq<BuddyBitmap>),
    Sleep(SleepMutex<BuddyBitmap>),
}

impl BitmapLock {
    fn alloc(&self, order: u32) -> Option<usize> {
        match self {
            BitmapLock::Atomic(l) => l.lock().alloc(order),
            BitmapLock::Sleep(l) => l.lock().alloc(order),
        }
    }
    fn free(&self, order: u32, idx: usize) {
        match self {
            BitmapLock::Atomic(l) => l.lock().free(order, idx),
            BitmapLock::Sleep(l) => l.lock().free(order, idx),
        }
    }
    fn has_free(&self, order: u32) -> bool {
        match self {
            BitmapLock::Atomic(l) => l.lock().has_free(order),
            BitmapLock::Sleep(l) => l.lock().has_free(order),
        }
    }
    fn recompute(&self) {
        match self {
            BitmapLock::Atomic(l) => l.lock().recompute_internal_nodes(),
            BitmapLock::Sleep(l) => l.lock().recompute_internal_nodes(),
        }
    }

    fn reserve_leaf(&self, leaf_idx: usize) {
        match self {
            BitmapLock::Atomic(l) => {
                let mut guard = l.lock();
                let leaf_layer_start = BuddyBitmap::layer_start(guard.max_order);
                guard.set_bit(leaf_layer_start + leaf_idx, true);
            }
            BitmapLock::Sleep(l) => {
                let mut guard = l.lock();
                let leaf_layer_start = BuddyBitmap::layer_start(guard.max_order);
                guard.set_bit(leaf_layer_start + leaf_idx, true);
            }
        }
    }
}

struct Area {
    base: u64,
    real_pages: u64,
    mode: AreaMode,
    bitmap: BitmapLock,
    in_flight: AtomicUsize,
}

impl Area {
    fn leaf_is_reserved_tail(&self, leaf_idx: u64) -> bool {
        leaf_idx >= self.real_pages
    }
}

struct Zone {
    kind: ZoneKind,
    areas: Vec<Area>,
}

impl Zone {
    fn alloc_pages(&self, order: u32, atomic: bool) -> Option<u64> {
        for _ in 0..ALLOC_RETRY_BOUND {
            let wanted_mode = if atomic { AreaMode::Atomic } else { AreaMode::Sleep };
            let mut best: Option<usize> = None;
            let mut best_inflight = usize::MAX;
            for (i, area) in self.areas.iter().enumerate() {
                if area.mode != wanted_mode {
                    continue;
                }
                if !area.bitmap.has_free(order) {
                    continue;
                }
                let inflight = area.in_flight.load(Ordering::Relaxed);
                if inflight < best_inflight {
                    best_inflight = inflight;
                    best = Some(i);
                }
            }
            let Some(i) = best else { return None };
            let area = &self.areas[i];
            area.in_flight.fetch_add(1, Ordering::Relaxed);
            let result = area.bitmap.alloc(order);
            area.in_flight.fetch_sub(1, Ordering::Relaxed);
            if let Some(idx) = result {
                let local = idx - BuddyBitmap::layer_start(MAX_ORDER - order);
                let page_offset = (local as u64) << order;
                return Some(area.base + page_offset * PAGE_SIZE);
            }
        }
        None
    }

    fn free_pages(&self, phys: u64, order: u32) -> bool {
        for area in &self.areas {
            let span = AREA_PAGES * PAGE_SIZE;
            if phys >= area.base && phys < area.base + span {
                let leaf = (phys - area.base) / PAGE_SIZE;
                let layer = MAX_ORDER - order;
                let idx = BuddyBitmap::layer_start(layer) + (leaf >> order) as usize;
                area.bitmap.free(order, idx);
                return true;
            }
        }
        false
    }
}

pub struct Buddy {
    zones: SpinMutex<Vec<Zone>>,
}

static BUDDY: Buddy = Buddy { zones: SpinMutex::new(Vec::new()) };

fn zone_kind_for(addr: u64) -> ZoneKind {
    use crate::memory::layout::{DMA32_ZONE_LIMIT, DMA_ZONE_LIMIT};
    if addr < DMA_ZONE_LIMIT {
        ZoneKind::Dma
    } else if addr < DMA32_ZONE_LIMIT {
        ZoneKind::Dma32
    } else {
        ZoneKind::Normal
    }
}

/// Build zones and areas over the usable ranges of the boot memory map,
/// then mark every non-usable frame allocated at leaf granularity. Runs
/// exactly once, early in boot, before any other allocator is live.
pub fn init(memory_regions: &MemoryRegions) {
    let mut dma = Vec::new();
    let mut dma32 = Vec::new();
    let mut normal = Vec::new();

    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let mut base = align_up(region.start, AREA_PAGES * PAGE_SIZE);
        let end = region.end;
        let mut area_index = 0usize;
        while base + PAGE_SIZE <= end {
            let span = AREA_PAGES * PAGE_SIZE;
            let real_bytes = core::cmp::min(span, end - base);
            let real_pages = real_bytes / PAGE_SIZE;
            if real_pages == 0 {
                break;
            }
            let mode = if area_index % ATOMIC_AREA_STRIDE == 0 { AreaMode::Atomic } else { AreaMode::Sleep };
            let bitmap = BuddyBitmap::new(MAX_ORDER);
            let bitmap_lock = match mode {
                AreaMode::Atomic => BitmapLock::Atomic(SpinLockIrq::new(bitmap)),
                AreaMode::Sleep => BitmapLock::Sleep(SleepMutex::new(bitmap)),
            };
            let area = Area { base, real_pages, mode, bitmap: bitmap_lock, in_flight: AtomicUsize::new(0) };
            // Pre-reserve the tail beyond `real_pages` so the tree stays complete.
            for leaf in real_pages..AREA_PAGES {
                if area.leaf_is_reserved_tail(leaf) {
                    area.bitmap.reserve_leaf(leaf as usize);
                }
            }
            match zone_kind_for(base) {
                ZoneKind::Dma => dma.push(area),
                ZoneKind::Dma32 => dma32.push(area),
                ZoneKind::Normal => normal.push(area),
            }
            area_index += 1;
            base += span;
        }
    }

    let mut zones = Vec::new();
    zones.push(Zone { kind: ZoneKind::Dma, areas: dma });
    zones.push(Zone { kind: ZoneKind::Dma32, areas: dma32 });
    zones.push(Zone { kind: ZoneKind::Normal, areas: normal });
    *BUDDY.zones.lock() = zones;

    // Reserve the non-usable ranges at leaf granularity; idempotent and
    // tolerant of overlaps since each call only ever sets bits.
    for region in memory_regions.iter() {
        if region.kind == MemoryRegionKind::Usable {
            continue;
        }
        reserve_range(region.start, region.end);
    }
    // Null-pointer guard: the first physical page is never returned.
    reserve_range(0, PAGE_SIZE);

    // Leaf bits for every reservation (tail padding + non-usable ranges) are
    // now in place; propagate them up to ancestors in one pass per area.
    for zone in BUDDY.zones.lock().iter() {
        for area in &zone.areas {
            area.bitmap.recompute();
        }
    }

    log::info!(
        "buddy: zones initialized (dma={} dma32={} normal={} areas)",
        BUDDY.zones.lock()[0].areas.len(),
        BUDDY.zones.lock()[1].areas.len(),
        BUDDY.zones.lock()[2].areas.len()
    );
}

fn reserve_range(start: u64, end: u64) {
    let zones = BUDDY.zones.lock();
    for zone in zones.iter() {
        for area in &zone.areas {
            let span = AREA_PAGES * PAGE_SIZE;
            let area_end = area.base + span;
            let lo = core::cmp::max(start, area.base);
            let hi = core::cmp::min(end, area_end);
            let mut p = align_up(lo, PAGE_SIZE);
            while p + PAGE_SIZE <= hi {
                let leaf = (p - area.base) / PAGE_SIZE;
                area.bitmap.reserve_leaf(leaf as usize);
                p += PAGE_SIZE;
            }
        }
    }
}

fn cascade(hint: ZoneKind) -> &'static [ZoneKind] {
    match hint {
        ZoneKind::Normal => &[ZoneKind::Normal, ZoneKind::Dma32, ZoneKind::Dma],
        ZoneKind::Dma32 => &[ZoneKind::Dma32, ZoneKind::Dma],
        ZoneKind::Dma => &[ZoneKind::Dma],
    }
}

/// Allocate `2^order` contiguous, page-aligned pages from `zone_hint`,
/// cascading to more permissive zones if that zone is exhausted. Returns 0
/// on failure unless `no_fail` is set, in which case it retries forever,
/// invoking the OOM notifier between rounds.
pub fn alloc_pages(zone_hint: ZoneKind, order: u32, no_fail: bool) -> u64 {
    if order > MAX_ORDER {
        log::error!("buddy: alloc_pages order {} exceeds MAX_ORDER {}", order, MAX_ORDER);
        return 0;
    }
    loop {
        let zones = BUDDY.zones.lock();
        for kind in cascade(zone_hint) {
            if let Some(zone) = zones.iter().find(|z| z.kind == *kind) {
                let atomic = !crate::task::scheduler::is_running() || crate::per_cpu::preempt_count() > 0;
                if let Some(phys) = zone.alloc_pages(order, atomic) {
                    return phys;
                }
            }
        }
        drop(zones);
        if !no_fail {
            return 0;
        }
        crate::memory::oom::notify();
    }
}

pub fn alloc_page(zone_hint: ZoneKind) -> u64 {
    alloc_pages(zone_hint, 0, false)
}

/// Return `2^order` pages starting at `phys` to the allocator.
pub fn free_pages(phys: u64, order: u32) {
    if order > MAX_ORDER || phys == 0 || phys % PAGE_SIZE != 0 {
        log::error!("buddy: free_pages invalid phys={:#x} order={}", phys, order);
        return;
    }
    let zones = BUDDY.zones.lock();
    for zone in zones.iter() {
        if zone.free_pages(phys, order) {
            return;
        }
    }
    log::error!("buddy: free_pages phys={:#x} did not match any area", phys);
}

pub fn free_page(phys: u64) {
    free_pages(phys, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_layer_arithmetic_round_trips() {
        let bm = BuddyBitmap::new(4);
        for layer in 0..=4u32 {
            let start = BuddyBitmap::layer_start(layer);
            assert_eq!(start, (1usize << layer) - 1);
        }
    }

    #[test]
    fn single_area_alloc_then_free_allows_realloc() {
        let mut bm = BuddyBitmap::new(4); // 16 leaves
        let idx = bm.alloc(2).expect("alloc order 2"); // 4-page block
        assert!(bm.get_bit(idx));
        bm.free(2, idx);
        let idx2 = bm.alloc(2).expect("realloc order 2");
        assert!(bm.get_bit(idx2));
    }

    #[test]
    fn exhausting_root_order_fails_cleanly() {
        let mut bm = BuddyBitmap::new(2); // 4 leaves, max order 2
        assert!(bm.alloc(2).is_some());
        assert!(bm.alloc(2).is_none());
    }

    #[test]
    fn buddies_coalesce_on_free() {
        let mut bm = BuddyBitmap::new(2); // 4 leaves: two order-1 blocks
        let a = bm.alloc(1).unwrap();
        let b = bm.alloc(1).unwrap();
        assert!(bm.alloc(1).is_none());
        bm.free(1, a);
        bm.free(1, b);
        // Root fully free again: an order-2 allocation should now succeed.
        assert!(bm.alloc(2).is_some());
    }
}
