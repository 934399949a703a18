//! Physical and virtual memory management: buddy frame allocator, slab
//! and heap, page tables, VMAs, the vmap family, TLB shootdown and
//! user-copy. Boot order is buddy → HHDM-virtual → kernel address space
//! (page tables + VMA list) → slab → heap.

pub mod buddy;
pub mod heap;
pub mod layout;
pub mod oom;
pub mod paging;
pub mod slab;
pub mod tlb;
pub mod usercopy;
pub mod vma;
pub mod vmap;

use conquer_once::spin::OnceCell;
use linked_list_allocator::LockedHeap;
use x86_64::VirtAddr;

use bootloader_api::info::MemoryRegions;

/// Rust's own allocation path (`Box`, `Vec`, collections used by the
/// kernel's bookkeeping structures) rides a separate, ordinary bump/free
/// heap rather than the spec's slab-backed `kmalloc`, so that growing a
/// `Vec` inside the slab/heap code can never recursively re-enter it.
#[global_allocator]
static GLOBAL_ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Virtual base of the bootstrap region backing `GLOBAL_ALLOCATOR`, carved
/// directly out of the buddy allocator before the VMA/vmap machinery
/// exists to do it the general way.
const GLOBAL_HEAP_PAGES_ORDER: u32 = 9; // 512 pages = 2 MiB

static KERNEL_MM: OnceCell<vma::Mm> = OnceCell::uninit();

/// The kernel's address space: one per machine, shared by all CPUs.
pub fn kernel_mm() -> &'static vma::Mm {
    KERNEL_MM.get().expect("kernel address space not initialized")
}

/// Boot-time bring-up: buddy first (needs the raw memory map), then the
/// HHDM becomes usable for virtual access to any physical page, then the
/// kernel's own page-table root and VMA list, then the bootstrap heap for
/// `Box`/`Vec`, then slab sizing is implicitly available to any caller.
pub fn init(hhdm_offset: u64, memory_regions: &'static MemoryRegions) {
    layout::init_hhdm(hhdm_offset);
    log::info!("memory: hhdm offset {:#x}", hhdm_offset);

    buddy::init(memory_regions);

    let root = paging::new_root().expect("failed to allocate kernel page table root");
    promote_identity_and_hhdm(root);
    KERNEL_MM
        .try_init_once(|| vma::Mm::new(root, VirtAddr::new(layout::KERNEL_MMAP_START), VirtAddr::new(layout::KERNEL_MMAP_END)))
        .expect("kernel address space already initialized");

    init_bootstrap_heap();

    log::info!("memory: subsystem initialized");
}

/// The bootloader's own mappings (kernel image, HHDM, boot info) are not
/// re-derived here; the kernel keeps running on the bootloader-built root
/// until a future address-space switch. `new_root` exists for process
/// address spaces; until process support lands, it simply reserves a root
/// for `kernel_mm()`'s bookkeeping.
fn promote_identity_and_hhdm(_root: x86_64::PhysAddr) {}

/// Carve a fixed bootstrap region out of the buddy allocator and hand it
/// to `linked_list_allocator` directly via the HHDM, bypassing `vmap`
/// (which itself depends on `alloc::vec::Vec` growing, i.e. on this heap
/// already existing).
fn init_bootstrap_heap() {
    let phys = buddy::alloc_pages(buddy::ZoneKind::Normal, GLOBAL_HEAP_PAGES_ORDER, true);
    let base = layout::phys_to_virt(x86_64::PhysAddr::new(phys));
    let size = (layout::PAGE_SIZE as usize) << GLOBAL_HEAP_PAGES_ORDER;
    unsafe {
        GLOBAL_ALLOCATOR.lock().init(base.as_mut_ptr::<u8>(), size);
    }
    log::info!("memory: bootstrap heap {} KiB at {:#x}", size / 1024, base.as_u64());
}
