//! Narrow boundary modules for data the boot loader hands off besides the
//! memory map and HHDM offset: today, just the initrd inventory.

pub mod initrd;
