//! Interrupt controller abstraction. The highest-rated controller whose
//! `init_bsp` succeeds is selected once at boot; everything downstream
//! (ISR registration, shootdown/reschedule IPIs) goes through its vtable
//! rather than touching hardware directly.

use conquer_once::spin::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    Reschedule,
    TlbShootdown,
}

/// Ops a controller must provide. `send_ipi` takes the target APIC/CPU id
/// (ignored by the PIC, which cannot target a specific CPU and instead
/// services the single-CPU case it's restricted to).
pub struct ControllerOps {
    pub name: &'static str,
    pub rating: u32,
    pub init_bsp: fn() -> bool,
    pub install: fn(irq: u32, vector: u8),
    pub uninstall: fn(irq: u32),
    pub mask: fn(irq: u32, masked: bool),
    pub eoi: fn(irq: u32),
    pub wait_pending: fn(irq: u32),
    pub send_ipi: fn(target_cpu: u32, vector: u8, critical: bool),
    pub send_ipi_all_but_self: fn(vector: u8),
}

static SELECTED: OnceCell<&'static ControllerOps> = OnceCell::uninit();

const CANDIDATES: &[&ControllerOps] = &[&crate::interrupts::apic::OPS, &crate::interrupts::pic::OPS];

/// Pick the highest-rated candidate whose `init_bsp` succeeds.
pub fn select() {
    let mut ordered: [&ControllerOps; 2] = [CANDIDATES[0], CANDIDATES[1]];
    if ordered[0].rating < ordered[1].rating {
        ordered.swap(0, 1);
    }
    for candidate in ordered {
        if (candidate.init_bsp)() {
            log::info!("interrupts: selected controller {}", candidate.name);
            SELECTED.try_init_once(|| candidate).ok();
            return;
        }
    }
    panic!("no usable interrupt controller found");
}

fn ops() -> &'static ControllerOps {
    SELECTED.get().expect("interrupt controller not selected")
}

pub fn install(irq: u32, vector: u8) {
    (ops().install)(irq, vector)
}

pub fn uninstall(irq: u32) {
    (ops().uninstall)(irq)
}

pub fn mask(irq: u32, masked: bool) {
    (ops().mask)(irq, masked)
}

pub fn eoi(irq: u32) {
    (ops().eoi)(irq)
}

pub fn wait_pending(irq: u32) {
    (ops().wait_pending)(irq)
}

pub fn send_ipi(target_cpu: u32, ipi: Ipi) {
    let vector = vector_for(ipi);
    (ops().send_ipi)(target_cpu, vector, ipi == Ipi::TlbShootdown);
}

pub fn send_ipi_all_but_self(ipi: Ipi) {
    let vector = vector_for(ipi);
    (ops().send_ipi_all_but_self)(vector);
}

pub const RESCHEDULE_VECTOR: u8 = 0xFC;
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xFD;

fn vector_for(ipi: Ipi) -> u8 {
    match ipi {
        Ipi::Reschedule => RESCHEDULE_VECTOR,
        Ipi::TlbShootdown => TLB_SHOOTDOWN_VECTOR,
    }
}
