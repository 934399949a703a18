//! Single-address-space 4-level page tables. `map`/`update`/`unmap`/
//! `resolve` walk the table tree directly (rather than through
//! `x86_64::structures::paging::Mapper`) so intermediate tables can be
//! auto-allocated on demand and auto-collapsed when they empty out, and so
//! 2 MiB huge leaves at level 2 are recognized without a separate code
//! path.

use bitflags::bitflags;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags as HwFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::Errno;
use crate::memory::buddy::{self, ZoneKind};
use crate::memory::layout::{phys_to_virt, PAGE_SIZE, PAGE_SIZE_2M};

bitflags! {
    /// Language-neutral protection request, translated into hardware bits
    /// by `hw_flags_for`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Protection: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXECUTE       = 1 << 2;
        const USER          = 1 << 3;
        const WRITETHROUGH  = 1 << 4;
        const CACHE_DISABLE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
}

impl PageSize {
    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => PAGE_SIZE,
            PageSize::Size2M => PAGE_SIZE_2M,
        }
    }
}

/// Translate the protection mask into present/RW/user/PWT/PCD/NX bits.
/// Requesting both `WRITETHROUGH` and `CACHE_DISABLE` is rejected — the two
/// caching modes are mutually exclusive in this driver.
pub fn hw_flags_for(prot: Protection, huge: bool) -> Result<HwFlags, Errno> {
    if prot.contains(Protection::WRITETHROUGH) && prot.contains(Protection::CACHE_DISABLE) {
        return Err(Errno::Inval);
    }
    let mut flags = HwFlags::PRESENT;
    if prot.contains(Protection::WRITE) {
        flags |= HwFlags::WRITABLE;
    }
    if prot.contains(Protection::USER) {
        flags |= HwFlags::USER_ACCESSIBLE;
    }
    if prot.contains(Protection::WRITETHROUGH) {
        flags |= HwFlags::WRITE_THROUGH;
    }
    if prot.contains(Protection::CACHE_DISABLE) {
        flags |= HwFlags::NO_CACHE;
    }
    if !prot.contains(Protection::EXECUTE) {
        flags |= HwFlags::NO_EXECUTE;
    }
    if huge {
        flags |= HwFlags::HUGE_PAGE;
    }
    Ok(flags)
}

fn table_at(frame: PhysAddr) -> &'static mut PageTable {
    let virt = phys_to_virt(frame);
    unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
}

fn alloc_table() -> Result<PhysAddr, Errno> {
    let phys = buddy::alloc_page(ZoneKind::Normal);
    if phys == 0 {
        return Err(Errno::NoMem);
    }
    let table = table_at(PhysAddr::new(phys));
    table.zero();
    Ok(PhysAddr::new(phys))
}

fn free_table(frame: PhysAddr) {
    buddy::free_page(frame.as_u64());
}

fn table_is_empty(table: &PageTable) -> bool {
    table.iter().all(|e| !e.flags().contains(HwFlags::PRESENT))
}

/// Walk `root` to the leaf entry covering `virt`. When `create` is set,
/// missing intermediate tables are allocated zero-filled; on allocation
/// failure the tables allocated so far by this call are unwound and freed.
/// Recognizes a 2 MiB huge leaf at level 2 without requiring the caller to
/// specify the page size up front.
pub fn walk(root: PhysAddr, virt: VirtAddr, create: bool) -> Result<(*mut PageTableEntry, PageSize), Errno> {
    let indices = [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
        usize::from(virt.p1_index()),
    ];
    let mut allocated: [Option<PhysAddr>; 3] = [None; 3];
    let mut frame = root;

    for level in 0..3 {
        let table = table_at(frame);
        let entry = &mut table[indices[level]];

        if level == 2 && entry.flags().contains(HwFlags::PRESENT) && entry.flags().contains(HwFlags::HUGE_PAGE) {
            return Ok((entry as *mut PageTableEntry, PageSize::Size2M));
        }

        if !entry.flags().contains(HwFlags::PRESENT) {
            if !create {
                return Err(Errno::NoEnt);
            }
            match alloc_table() {
                Ok(next) => {
                    allocated[level] = Some(next);
                    entry.set_addr(next, HwFlags::PRESENT | HwFlags::WRITABLE | HwFlags::USER_ACCESSIBLE);
                }
                Err(e) => {
                    for a in allocated.iter().flatten().rev() {
                        free_table(*a);
                    }
                    return Err(e);
                }
            }
        }
        frame = entry.addr();
    }

    let leaf_table = table_at(frame);
    let entry = &mut leaf_table[indices[3]];
    Ok((entry as *mut PageTableEntry, PageSize::Size4K))
}

/// Install a mapping at `virt` -> `phys` with the given size and
/// protection, auto-allocating intermediate tables.
pub fn map(root: PhysAddr, virt: VirtAddr, phys: PhysAddr, size: PageSize, prot: Protection) -> Result<(), Errno> {
    let huge = size == PageSize::Size2M;
    let flags = hw_flags_for(prot, huge)?;
    let (entry_ptr, found_size) = if huge {
        walk_for_huge(root, virt)?
    } else {
        walk(root, virt, true)?
    };
    debug_assert_eq!(found_size, size);
    let entry = unsafe { &mut *entry_ptr };
    entry.set_addr(phys, flags);
    Ok(())
}

/// Like `walk` but stops and allocates at level 2 for a 2 MiB leaf rather
/// than descending to level 1.
fn walk_for_huge(root: PhysAddr, virt: VirtAddr) -> Result<(*mut PageTableEntry, PageSize), Errno> {
    let indices = [usize::from(virt.p4_index()), usize::from(virt.p3_index()), usize::from(virt.p2_index())];
    let mut allocated: [Option<PhysAddr>; 2] = [None; 2];
    let mut frame = root;
    for level in 0..2 {
        let table = table_at(frame);
        let entry = &mut table[indices[level]];
        if !entry.flags().contains(HwFlags::PRESENT) {
            match alloc_table() {
                Ok(next) => {
                    allocated[level] = Some(next);
                    entry.set_addr(next, HwFlags::PRESENT | HwFlags::WRITABLE | HwFlags::USER_ACCESSIBLE);
                }
                Err(e) => {
                    for a in allocated.iter().flatten().rev() {
                        free_table(*a);
                    }
                    return Err(e);
                }
            }
        }
        frame = entry.addr();
    }
    let table = table_at(frame);
    let entry = &mut table[indices[2]];
    Ok((entry as *mut PageTableEntry, PageSize::Size2M))
}

/// Change the protection bits of an existing mapping, preserving its
/// physical address and size.
pub fn update(root: PhysAddr, virt: VirtAddr, prot: Protection) -> Result<(), Errno> {
    let (entry_ptr, size) = walk(root, virt, false)?;
    let entry = unsafe { &mut *entry_ptr };
    if !entry.flags().contains(HwFlags::PRESENT) {
        return Err(Errno::NoEnt);
    }
    let phys = entry.addr();
    let flags = hw_flags_for(prot, size == PageSize::Size2M)?;
    entry.set_addr(phys, flags);
    Ok(())
}

/// Remove the mapping at `virt`, then collapse any intermediate table left
/// fully empty by the removal.
pub fn unmap(root: PhysAddr, virt: VirtAddr) -> Result<(PhysAddr, PageSize), Errno> {
    let indices = [
        usize::from(virt.p4_index()),
        usize::from(virt.p3_index()),
        usize::from(virt.p2_index()),
        usize::from(virt.p1_index()),
    ];
    let mut frames = [root; 4];
    let mut frame = root;
    for level in 0..3 {
        let table = table_at(frame);
        let entry = &table[indices[level]];
        if !entry.flags().contains(HwFlags::PRESENT) {
            return Err(Errno::NoEnt);
        }
        if level == 2 && entry.flags().contains(HwFlags::HUGE_PAGE) {
            let phys = entry.addr();
            let table = table_at(frame);
            table[indices[level]].set_unused();
            collapse_if_empty(root, &indices, level);
            return Ok((phys, PageSize::Size2M));
        }
        frame = entry.addr();
        frames[level + 1] = frame;
    }
    let leaf_table = table_at(frame);
    let entry = &leaf_table[indices[3]];
    if !entry.flags().contains(HwFlags::PRESENT) {
        return Err(Errno::NoEnt);
    }
    let phys = entry.addr();
    leaf_table[indices[3]].set_unused();
    collapse_if_empty(root, &indices, 3);
    Ok((phys, PageSize::Size4K))
}

/// Walk back up from the leaf that was just cleared, freeing and
/// unlinking any table that is now fully empty.
fn collapse_if_empty(root: PhysAddr, indices: &[usize; 4], cleared_level: usize) {
    let mut chain = [root; 4];
    let mut frame = root;
    for level in 0..cleared_level {
        let table = table_at(frame);
        frame = table[indices[level]].addr();
        chain[level + 1] = frame;
    }
    let mut level = cleared_level;
    while level > 0 {
        let child_frame = chain[level];
        let child_table = table_at(child_frame);
        if !table_is_empty(child_table) {
            break;
        }
        let parent_frame = chain[level - 1];
        let parent_table = table_at(parent_frame);
        parent_table[indices[level - 1]].set_unused();
        free_table(child_frame);
        level -= 1;
    }
}

/// Translate `virt` to its mapped physical address plus in-page offset, or
/// `None` if unmapped.
pub fn resolve(root: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, u64)> {
    let (entry_ptr, size) = walk(root, virt, false).ok()?;
    let entry = unsafe { &*entry_ptr };
    if !entry.flags().contains(HwFlags::PRESENT) {
        return None;
    }
    let mask = size.bytes() - 1;
    let offset = virt.as_u64() & mask;
    Some((entry.addr(), offset))
}

/// Allocate a fresh, zero-filled level-4 table for a new address space.
pub fn new_root() -> Result<PhysAddr, Errno> {
    alloc_table()
}

pub fn free_root(root: PhysAddr) {
    free_table(root);
}
