//! Local xAPIC: the preferred interrupt controller whenever `CPUID` shows
//! one present. The teacher never needed one (it targets a single-CPU
//! PIC8259 configuration), so this is authored fresh against the standard
//! xAPIC MMIO layout, mapped the same way `time::hpet` maps its own
//! device — via `vmap::iomap` rather than an identity mapping.
//!
//! IPIs (reschedule, TLB shootdown) and the per-CPU timer tick are this
//! controller's reason for existing; routing of external device IRQs goes
//! through a minimal I/O APIC redirection table, enough to install/mask/
//! EOI a line without symmetric multi-IOAPIC rebalancing.

use core::sync::atomic::{AtomicU64, Ordering};

use conquer_once::spin::OnceCell;
use x86_64::registers::model_specific::Msr;
use x86_64::PhysAddr;

use crate::interrupts::controller::ControllerOps;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const LAPIC_DEFAULT_PHYS: u64 = 0xFEE0_0000;
const IOAPIC_DEFAULT_PHYS: u64 = 0xFEC0_0000;

// Local APIC register offsets (32-bit each, regardless of the field width
// actually in use).
const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0B0;
const REG_SPURIOUS: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL_COUNT: usize = 0x380;
const REG_TIMER_CURRENT_COUNT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const SPURIOUS_APIC_ENABLE: u32 = 1 << 8;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const LVT_MASKED: u32 = 1 << 16;

/// Vector the per-CPU timer tick fires on; a dynamic ISR vector allocated
/// once and shared by every CPU's local APIC timer.
pub const TIMER_VECTOR: u8 = 0x28;

static LAPIC_VBASE: OnceCell<u64> = OnceCell::uninit();
static IOAPIC_VBASE: OnceCell<u64> = OnceCell::uninit();
static TIMER_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);

fn has_apic() -> bool {
    let features = unsafe { core::arch::x86_64::__cpuid(1) };
    features.edx & (1 << 9) != 0
}

fn lapic_read(offset: usize) -> u32 {
    let base = *LAPIC_VBASE.get().expect("lapic not mapped");
    unsafe { core::ptr::read_volatile((base as usize + offset) as *const u32) }
}

fn lapic_write(offset: usize, value: u32) {
    let base = *LAPIC_VBASE.get().expect("lapic not mapped");
    unsafe { core::ptr::write_volatile((base as usize + offset) as *mut u32, value) }
}

fn ioapic_regs() -> (usize, usize) {
    let base = *IOAPIC_VBASE.get().expect("ioapic not mapped") as usize;
    (base, base + 0x10)
}

fn ioapic_write(reg: u32, value: u32) {
    let (sel, data) = ioapic_regs();
    unsafe {
        core::ptr::write_volatile(sel as *mut u32, reg);
        core::ptr::write_volatile(data as *mut u32, value);
    }
}

fn ioapic_redirection_reg(irq: u32) -> u32 {
    0x10 + irq * 2
}

fn enable_via_msr() {
    let mut msr = Msr::new(IA32_APIC_BASE_MSR);
    unsafe {
        let value = msr.read();
        msr.write(value | APIC_BASE_ENABLE);
    }
}

fn init_bsp() -> bool {
    if !has_apic() {
        return false;
    }
    let lapic_phys = PhysAddr::new(LAPIC_DEFAULT_PHYS);
    let Ok((lapic_vaddr, _)) = crate::memory::vmap::iomap(lapic_phys, 0x1000) else {
        return false;
    };
    LAPIC_VBASE.try_init_once(|| lapic_vaddr.as_u64()).ok();

    let ioapic_phys = PhysAddr::new(IOAPIC_DEFAULT_PHYS);
    if let Ok((ioapic_vaddr, _)) = crate::memory::vmap::iomap(ioapic_phys, 0x20) {
        IOAPIC_VBASE.try_init_once(|| ioapic_vaddr.as_u64()).ok();
    }

    enable_via_msr();
    lapic_write(REG_SPURIOUS, lapic_read(REG_SPURIOUS) | SPURIOUS_APIC_ENABLE | 0xFF);
    calibrate_timer();
    install_timer();
    true
}

/// Each AP also needs its own local APIC enabled and the same periodic
/// timer programmed (the LVT/ICR registers are per-CPU even though they
/// sit at the same MMIO address; every core's access goes to its own
/// physical local APIC).
pub fn init_this_cpu() {
    enable_via_msr();
    lapic_write(REG_SPURIOUS, lapic_read(REG_SPURIOUS) | SPURIOUS_APIC_ENABLE | 0xFF);
    install_timer();
}

/// Calibrate the local APIC timer's divide-by-16 tick frequency against
/// the timekeeper, the same reference-clock approach `time::tsc` uses
/// against HPET.
fn calibrate_timer() {
    const CALIBRATION_MS: u64 = 10;
    lapic_write(REG_TIMER_DIVIDE, 0x3); // divide by 16
    lapic_write(REG_TIMER_INITIAL_COUNT, u32::MAX);
    crate::time::stall_ns(CALIBRATION_MS * 1_000_000);
    let remaining = lapic_read(REG_TIMER_CURRENT_COUNT);
    let elapsed = u32::MAX - remaining;
    let freq = (elapsed as u64).saturating_mul(1000) / CALIBRATION_MS;
    TIMER_FREQUENCY_HZ.store(freq.max(1), Ordering::Release);
}

/// Preempt-tick rate: 1000 Hz, matched against the teacher's own scheduler
/// quantum granularity expectations.
const TICK_HZ: u64 = 1000;

fn install_timer() {
    let freq = TIMER_FREQUENCY_HZ.load(Ordering::Acquire).max(1);
    let count = (freq / TICK_HZ).max(1) as u32;
    lapic_write(REG_LVT_TIMER, (TIMER_VECTOR as u32) | LVT_TIMER_PERIODIC);
    lapic_write(REG_TIMER_DIVIDE, 0x3);
    lapic_write(REG_TIMER_INITIAL_COUNT, count);
}

fn install(irq: u32, vector: u8) {
    if IOAPIC_VBASE.get().is_none() {
        return;
    }
    let low = vector as u32;
    let high = 0u32;
    ioapic_write(ioapic_redirection_reg(irq) + 1, high);
    ioapic_write(ioapic_redirection_reg(irq), low);
}

fn uninstall(irq: u32) {
    if IOAPIC_VBASE.get().is_none() {
        return;
    }
    ioapic_write(ioapic_redirection_reg(irq), LVT_MASKED);
}

fn mask(irq: u32, masked: bool) {
    if IOAPIC_VBASE.get().is_none() {
        return;
    }
    let reg = ioapic_redirection_reg(irq);
    let (sel, data) = ioapic_regs();
    let current = unsafe {
        core::ptr::write_volatile(sel as *mut u32, reg);
        core::ptr::read_volatile(data as *const u32)
    };
    let updated = if masked { current | LVT_MASKED } else { current & !LVT_MASKED };
    ioapic_write(reg, updated);
}

fn eoi(_irq: u32) {
    lapic_write(REG_EOI, 0);
}

fn wait_pending(_irq: u32) {
    // No generic remote-IRR readback without tracking each line's trigger
    // mode; EOI is unconditional and immediate for this controller.
}

fn send_ipi(target_cpu: u32, vector: u8, _critical: bool) {
    // Physical destination mode: write the target APIC id into ICR_HIGH,
    // then the vector (fixed delivery) into ICR_LOW, which triggers send.
    lapic_write(REG_ICR_HIGH, target_cpu << 24);
    lapic_write(REG_ICR_LOW, vector as u32);
    while lapic_read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

fn send_ipi_all_but_self(vector: u8) {
    const DEST_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;
    lapic_write(REG_ICR_LOW, vector as u32 | DEST_ALL_EXCLUDING_SELF);
    while lapic_read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Whether the BSP successfully mapped and enabled a local APIC. Guards
/// the AP bring-up path, which has nothing to do under the PIC fallback.
pub fn available() -> bool {
    LAPIC_VBASE.get().is_some()
}

pub fn local_apic_id() -> u32 {
    lapic_read(REG_ID) >> 24
}

pub static OPS: ControllerOps = ControllerOps {
    name: "xapic",
    rating: 100,
    init_bsp,
    install,
    uninstall,
    mask,
    eoi,
    wait_pending,
    send_ipi,
    send_ipi_all_but_self,
};
