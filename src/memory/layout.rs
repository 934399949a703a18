//! Address-space layout constants and the HHDM (higher-half direct map)
//! offset handed off by the boot loader.

use conquer_once::spin::OnceCell;
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;

/// DMA zone upper bound: physical addresses below this are DMA-capable by
/// legacy ISA devices.
pub const DMA_ZONE_LIMIT: u64 = 16 * 1024 * 1024;
/// DMA32 zone upper bound: addresses below this fit a 32-bit DMA engine.
pub const DMA32_ZONE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Anonymous mmap placement window in the kernel's own address space, used
/// for `vmap(ALLOC)` callers that don't pin a hint.
pub const KERNEL_MMAP_START: u64 = 0xFFFF_C000_0000_0000;
pub const KERNEL_MMAP_END: u64 = 0xFFFF_C800_0000_0000;

/// Addresses at or above this split belong to the kernel half of the
/// canonical 48-bit address space.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

static HHDM_OFFSET: OnceCell<u64> = OnceCell::uninit();

pub fn init_hhdm(offset: u64) {
    HHDM_OFFSET.try_init_once(|| offset).expect("hhdm offset already set");
}

#[inline]
pub fn hhdm_offset() -> u64 {
    *HHDM_OFFSET.get().expect("hhdm offset not initialized")
}

#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + hhdm_offset())
}

#[inline]
pub fn is_kernel_address(addr: VirtAddr) -> bool {
    addr.as_u64() >= KERNEL_SPACE_START
}

#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[inline]
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline]
pub fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
