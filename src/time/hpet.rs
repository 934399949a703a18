//! HPET: the early timekeeper. Usable the moment the memory subsystem can
//! map a page of MMIO, long before interrupts or per-CPU calibration are
//! available, which is why it is always the first source selected at boot.
//!
//! ACPI table parsing isn't implemented yet, so the base address is the
//! well-known fixed location most firmware places it at rather than one
//! looked up from the HPET ACPI table.

use core::sync::atomic::{AtomicU64, Ordering};

use conquer_once::spin::OnceCell;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::vmap;
use crate::time::timekeeper::TimekeeperOps;

const HPET_DEFAULT_PHYS: u64 = 0xFED0_0000;
const REG_CAPABILITIES: usize = 0x000;
const REG_CONFIG: usize = 0x010;
const REG_MAIN_COUNTER: usize = 0x0F0;

const CAP_COUNTER_64BIT: u64 = 1 << 13;
const CONFIG_ENABLE: u64 = 1 << 0;

static VBASE: OnceCell<VirtAddr> = OnceCell::uninit();
static FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);
static COUNTER_64BIT: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

fn reg_addr(offset: usize) -> *mut u64 {
    let base = *VBASE.get().expect("hpet not mapped");
    (base.as_u64() as usize + offset) as *mut u64
}

fn read_reg(offset: usize) -> u64 {
    unsafe { core::ptr::read_volatile(reg_addr(offset)) }
}

fn write_reg(offset: usize, value: u64) {
    unsafe { core::ptr::write_volatile(reg_addr(offset), value) }
}

fn init() -> bool {
    let (vaddr, _offset) = match vmap::iomap(PhysAddr::new(HPET_DEFAULT_PHYS), 0x400) {
        Ok(m) => m,
        Err(_) => return false,
    };
    VBASE.try_init_once(|| vaddr).ok();

    let caps = read_reg(REG_CAPABILITIES);
    let period_fs = caps >> 32;
    if period_fs == 0 {
        return false;
    }
    // femtoseconds per tick -> Hz: 1e15 / period_fs
    let freq = 1_000_000_000_000_000u64 / period_fs;
    FREQUENCY_HZ.store(freq, Ordering::Release);
    COUNTER_64BIT.store(caps & CAP_COUNTER_64BIT != 0, Ordering::Release);

    write_reg(REG_MAIN_COUNTER, 0);
    write_reg(REG_CONFIG, read_reg(REG_CONFIG) | CONFIG_ENABLE);

    let t0 = read_reg(REG_MAIN_COUNTER);
    let t1 = read_reg(REG_MAIN_COUNTER);
    t1 >= t0
}

fn read_ticks() -> u64 {
    if COUNTER_64BIT.load(Ordering::Relaxed) {
        read_reg(REG_MAIN_COUNTER)
    } else {
        read_reg(REG_MAIN_COUNTER) & 0xFFFF_FFFF
    }
}

fn frequency_hz() -> u64 {
    FREQUENCY_HZ.load(Ordering::Relaxed)
}

pub static OPS: TimekeeperOps = TimekeeperOps {
    name: "hpet",
    rating: 60,
    early: true,
    init,
    read_ticks,
    frequency_hz,
};
