//! The interrupt substrate: the pluggable controller (xAPIC preferred,
//! PIC8259 fallback), the 256-entry ISR table dynamic vectors register
//! against, the IDT and common trap path that dispatches into it, and
//! the softirq mechanism deferred work runs through.

pub mod apic;
pub mod controller;
pub mod exceptions;
pub mod isr;
pub mod pic;
pub mod softirq;

/// Bring up the whole substrate on the BSP: pick a controller, build and
/// load the IDT (which also registers the built-in softirqs). Must run
/// after `gdt::init` and before anything unmasks interrupts.
fn timer_isr_handler(_vector: u8) {
    softirq::raise(softirq::SOFTIRQ_TIMER);
}

pub fn init() {
    controller::select();
    exceptions::init();

    isr::reserve_vector(apic::TIMER_VECTOR);
    isr::reserve_vector(controller::RESCHEDULE_VECTOR);
    isr::reserve_vector(controller::TLB_SHOOTDOWN_VECTOR);
    isr::register(
        apic::TIMER_VECTOR,
        timer_isr_handler,
        isr::IrqOps { controller_irq: 0, eoi: Some(controller::eoi), mask: None, detach: None },
        false,
    );
}

/// Per-AP bring-up: enable and reprogram this core's local APIC. A no-op
/// under the PIC fallback, which only ever serves a single CPU.
pub fn init_this_cpu(_cpu_id: u32) {
    if apic::available() {
        apic::init_this_cpu();
    }
}
