//! The legacy 8259 PIC pair, lowest-rated controller and single-CPU
//! fallback for targets without a usable local APIC. Grounded directly on
//! the teacher's own PIC wiring: two cascaded controllers remapped to
//! vectors 32..48 so they never collide with CPU exceptions.

use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex as RawSpinMutex;

use pic8259::ChainedPics;

use crate::interrupts::controller::ControllerOps;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

static PICS: RawSpinMutex<ChainedPics> = RawSpinMutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// `ChainedPics` only exposes a write-only `write_masks`; this is the
/// shadow copy so masking one line doesn't clobber the others.
static MASK1: AtomicU8 = AtomicU8::new(0xFF);
static MASK2: AtomicU8 = AtomicU8::new(0xFF);

fn irq_to_line(irq: u32) -> u8 {
    irq as u8
}

fn init_bsp() -> bool {
    unsafe {
        PICS.lock().initialize();
        PICS.lock().write_masks(0xFF, 0xFF);
    }
    MASK1.store(0xFF, Ordering::Relaxed);
    MASK2.store(0xFF, Ordering::Relaxed);
    true
}

/// The PIC has no vector-routing table of its own: "install" just means
/// unmasking the line, since the vector is fixed at `PIC_1_OFFSET + irq`
/// by the remap above and the caller already allocated a matching vector.
fn install(irq: u32, _vector: u8) {
    mask(irq, false);
}

fn uninstall(irq: u32) {
    mask(irq, true);
}

fn mask(irq: u32, masked: bool) {
    let line = irq_to_line(irq);
    let (reg, bit) = if line < 8 { (&MASK1, line) } else { (&MASK2, line - 8) };
    if masked {
        reg.fetch_or(1 << bit, Ordering::Relaxed);
    } else {
        reg.fetch_and(!(1 << bit), Ordering::Relaxed);
    }
    unsafe {
        PICS.lock().write_masks(MASK1.load(Ordering::Relaxed), MASK2.load(Ordering::Relaxed));
    }
}

fn eoi(irq: u32) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq_to_line(irq));
    }
}

fn wait_pending(_irq: u32) {
    // The PIC has no remote-IRR readback; nothing to poll on.
}

fn send_ipi(_target_cpu: u32, _vector: u8, _critical: bool) {
    // The PIC cannot target a specific CPU: the system it services is
    // single-CPU by construction, so a "self" IPI would be meaningless.
}

fn send_ipi_all_but_self(_vector: u8) {}

pub static OPS: ControllerOps = ControllerOps {
    name: "pic8259",
    rating: 10,
    init_bsp,
    install,
    uninstall,
    mask,
    eoi,
    wait_pending,
    send_ipi,
    send_ipi_all_but_self,
};
