//! Per-address-space virtual memory area (VMA) bookkeeping. Each address
//! space keeps an ordered, non-overlapping list of VMAs describing what a
//! virtual range is for; the page tables describe how it is mapped. The
//! two are kept in lockstep by `vmap.rs`.

use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::Errno;
use crate::memory::layout::PAGE_SIZE;
use crate::memory::paging::Protection;
use crate::sync::mutex::Mutex;

bitflags::bitflags! {
    /// Origin/purpose flags carried alongside a VMA's protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OriginFlags: u32 {
        const ALLOC      = 1 << 0;
        const PHYSICAL   = 1 << 1;
        const IOMEM      = 1 << 2;
        const HUGEPAGE_2M = 1 << 3;
        const FIXED      = 1 << 4;
        const NOREPLACE  = 1 << 5;
        const USER       = 1 << 6;
    }
}

#[derive(Debug, Clone)]
pub struct Vma {
    pub start: VirtAddr,
    pub top: VirtAddr,
    pub prot: Protection,
    pub origin: OriginFlags,
}

impl Vma {
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.top
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.top
    }

    pub fn size(&self) -> u64 {
        self.top.as_u64() - self.start.as_u64()
    }

    fn mergeable_with(&self, other: &Vma) -> bool {
        self.prot == other.prot && self.origin == other.origin
    }
}

/// Ordered, non-overlapping VMA list for one address space.
pub struct VmaList {
    areas: Vec<Vma>,
}

impl VmaList {
    pub const fn new() -> Self {
        VmaList { areas: Vec::new() }
    }

    /// `vma_find(addr)`: returns the VMA with `start <= addr < top`, if any.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        // Areas are sorted by start; binary search for the predecessor.
        let idx = self.areas.partition_point(|v| v.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.areas[idx - 1];
        if candidate.contains(addr) {
            Some(candidate)
        } else {
            None
        }
    }

    fn index_of_first_overlap(&self, start: VirtAddr, end: VirtAddr) -> Option<usize> {
        self.areas.iter().position(|v| v.overlaps(start, end))
    }

    /// Find the first gap of at least `size` bytes at or after
    /// `max(hint, floor)`, scanning the list in order.
    pub fn find_gap(&self, size: u64, hint: VirtAddr, floor: VirtAddr, ceiling: VirtAddr, align: u64) -> Option<VirtAddr> {
        let align_up = |a: u64| (a + align - 1) & !(align - 1);
        let mut cursor = align_up(core::cmp::max(hint.as_u64(), floor.as_u64()));
        for vma in &self.areas {
            let vstart = vma.start.as_u64();
            if vstart <= cursor {
                cursor = core::cmp::max(cursor, align_up(vma.top.as_u64()));
                continue;
            }
            if vstart >= cursor && vstart - cursor >= size {
                return Some(VirtAddr::new(cursor));
            }
            cursor = align_up(vma.top.as_u64());
        }
        if ceiling.as_u64() >= cursor && ceiling.as_u64() - cursor >= size {
            return Some(VirtAddr::new(cursor));
        }
        None
    }

    /// Insert a new, non-overlapping VMA. No merge is performed here — map
    /// time never merges, only protect/unmap sweeps do.
    pub fn insert(&mut self, vma: Vma) -> Result<(), Errno> {
        if vma.start >= vma.top {
            return Err(Errno::Inval);
        }
        if self.index_of_first_overlap(vma.start, vma.top).is_some() {
            return Err(Errno::Exist);
        }
        let pos = self.areas.partition_point(|v| v.start < vma.start);
        self.areas.insert(pos, vma);
        Ok(())
    }

    /// Split the VMA intersecting `addr` at `addr`, if `addr` falls
    /// strictly inside it.
    fn split_at(&mut self, addr: VirtAddr) {
        if let Some(idx) = self.areas.iter().position(|v| v.contains(addr) && v.start != addr) {
            let original = self.areas[idx].clone();
            if original.start == addr {
                return;
            }
            let tail = Vma { start: addr, top: original.top, prot: original.prot, origin: original.origin };
            self.areas[idx].top = addr;
            self.areas.insert(idx + 1, tail);
        }
    }

    /// `vma_protect`: split head/tail as needed, apply `new_prot` to every
    /// VMA fully inside `[start, end)`, then sweep to merge neighbors with
    /// identical protection and origin flags.
    pub fn protect(&mut self, start: VirtAddr, end: VirtAddr, new_prot: Protection) -> Result<(), Errno> {
        if self.index_of_first_overlap(start, end).is_none() {
            return Err(Errno::NoEnt);
        }
        self.split_at(start);
        self.split_at(end);
        for vma in self.areas.iter_mut() {
            if vma.start >= start && vma.top <= end {
                vma.prot = new_prot;
            }
        }
        self.merge_adjacent();
        Ok(())
    }

    /// `vma_unmap`: remove full covers, chop heads/tails, split middles —
    /// all four overlap cases in one pass. Returns the removed (or
    /// partially removed) ranges for the caller to unmap physically.
    pub fn unmap(&mut self, start: VirtAddr, end: VirtAddr) -> Result<Vec<(VirtAddr, VirtAddr)>, Errno> {
        if start >= end {
            return Err(Errno::Inval);
        }
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.areas.len() {
            let vma = self.areas[i].clone();
            if !vma.overlaps(start, end) {
                i += 1;
                continue;
            }
            if start <= vma.start && end >= vma.top {
                // Full cover.
                removed.push((vma.start, vma.top));
                self.areas.remove(i);
                continue;
            }
            if start <= vma.start {
                // Head chop: advance start.
                removed.push((vma.start, end));
                self.areas[i].start = end;
                i += 1;
                continue;
            }
            if end >= vma.top {
                // Tail chop: retract top.
                removed.push((start, vma.top));
                self.areas[i].top = start;
                i += 1;
                continue;
            }
            // Middle split: insert a tail VMA, retract the original.
            removed.push((start, end));
            let tail = Vma { start: end, top: vma.top, prot: vma.prot, origin: vma.origin };
            self.areas[i].top = start;
            self.areas.insert(i + 1, tail);
            i += 2;
        }
        Ok(removed)
    }

    fn merge_adjacent(&mut self) {
        let mut i = 0;
        while i + 1 < self.areas.len() {
            let mergeable = self.areas[i].top == self.areas[i + 1].start && self.areas[i].mergeable_with(&self.areas[i + 1]);
            if mergeable {
                self.areas[i].top = self.areas[i + 1].top;
                self.areas.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.iter()
    }
}

impl Default for VmaList {
    fn default() -> Self {
        Self::new()
    }
}

/// An address space: a page-table root plus the VMA list describing it.
pub struct Mm {
    pub root: PhysAddr,
    pub vmas: Mutex<VmaList>,
    pub mmap_floor: VirtAddr,
    pub mmap_ceiling: VirtAddr,
}

impl Mm {
    pub fn new(root: PhysAddr, mmap_floor: VirtAddr, mmap_ceiling: VirtAddr) -> Self {
        Mm { root, vmas: Mutex::new(VmaList::new()), mmap_floor, mmap_ceiling }
    }
}

pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(start: u64, top: u64, prot: Protection) -> Vma {
        Vma { start: VirtAddr::new(start), top: VirtAddr::new(top), prot, origin: OriginFlags::ALLOC }
    }

    #[test]
    fn find_returns_none_outside_any_vma() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x2000, Protection::READ)).unwrap();
        assert!(list.find(VirtAddr::new(0x2000)).is_none());
        assert!(list.find(VirtAddr::new(0x500)).is_none());
    }

    #[test]
    fn find_returns_vma_containing_address() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x2000, Protection::READ)).unwrap();
        assert!(list.find(VirtAddr::new(0x1500)).is_some());
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x2000, Protection::READ)).unwrap();
        assert_eq!(list.insert(v(0x1800, 0x2800, Protection::READ)), Err(Errno::Exist));
    }

    #[test]
    fn unmap_full_cover_removes_vma() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x2000, Protection::READ)).unwrap();
        let removed = list.unmap(VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
        assert_eq!(removed, [(VirtAddr::new(0x1000), VirtAddr::new(0x2000))]);
        assert!(list.find(VirtAddr::new(0x1500)).is_none());
    }

    #[test]
    fn unmap_middle_splits_into_two() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x4000, Protection::READ)).unwrap();
        list.unmap(VirtAddr::new(0x2000), VirtAddr::new(0x3000)).unwrap();
        assert!(list.find(VirtAddr::new(0x1500)).is_some());
        assert!(list.find(VirtAddr::new(0x2500)).is_none());
        assert!(list.find(VirtAddr::new(0x3500)).is_some());
    }

    #[test]
    fn protect_merges_identical_neighbors() {
        let mut list = VmaList::new();
        list.insert(v(0x1000, 0x2000, Protection::READ)).unwrap();
        list.insert(v(0x2000, 0x3000, Protection::READ | Protection::WRITE)).unwrap();
        list.protect(VirtAddr::new(0x1000), VirtAddr::new(0x2000), Protection::READ | Protection::WRITE).unwrap();
        // Both spans now share protection and origin; the sweep should merge them.
        assert_eq!(list.areas.len(), 1);
    }
}
