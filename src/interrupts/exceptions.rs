//! The 256-entry IDT and the common trap path every non-exception vector
//! funnels through. CPU exceptions (0..32) get named handlers; the
//! dynamic range (32..256) shares a single generic handler, monomorphized
//! once per vector via a const generic so each entry still gets its own
//! concrete `extern "x86-interrupt"` function pointer without 224
//! hand-written bodies.
//!
//! The generic handler is also where the spec's hardirq/softirq/resched
//! bookkeeping around `isr::dispatch` lives: bump `preempt_count` on
//! entry, run the registered handler, and -- once nesting has unwound
//! back to the outermost interrupt -- drain softirqs and give the
//! scheduler a chance to preempt before returning to the interrupted
//! context.

use conquer_once::spin::OnceCell;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::interrupts::{controller, isr, softirq};

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    panic!("divide error at {:#x}\n{:#?}", frame.instruction_pointer.as_u64(), frame);
}

extern "x86-interrupt" fn debug_handler(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    log::error!("NMI at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    panic!("overflow at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn bound_range_handler(frame: InterruptStackFrame) {
    panic!("bound range exceeded at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode at {:#x}\n{:#?}", frame.instruction_pointer.as_u64(), frame);
}

extern "x86-interrupt" fn device_not_available_handler(frame: InterruptStackFrame) {
    panic!("device not available (fpu) at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic!("DOUBLE FAULT (error={:#x}) at {:#x}\n{:#?}", error_code, frame.instruction_pointer.as_u64(), frame);
}

extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("invalid TSS (selector={:#x}) at {:#x}", error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("segment not present (selector={:#x}) at {:#x}", error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("stack segment fault (error={:#x}) at {:#x}", error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!(
        "general protection fault (error={:#x}) at {:#x}\n{:#?}",
        error_code,
        frame.instruction_pointer.as_u64(),
        frame
    );
}

/// The one exception whose handler doesn't just panic: a fault at a
/// registered usercopy access point resumes at its fixup instead of
/// escalating, exactly the contract `memory::usercopy` documents.
extern "x86-interrupt" fn page_fault_handler(mut frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    let fault_addr = Cr2::read().unwrap_or(x86_64::VirtAddr::zero()).as_u64();
    let fault_rip = frame.instruction_pointer.as_u64();

    if let Some(fixup_rip) = crate::memory::usercopy::lookup_fixup(fault_rip) {
        unsafe {
            frame.as_mut().update(|f| f.instruction_pointer = x86_64::VirtAddr::new(fixup_rip));
        }
        return;
    }

    panic!(
        "page fault accessing {:#x} (error={:?}) at rip {:#x}\n{:#?}",
        fault_addr, error_code, fault_rip, frame
    );
}

extern "x86-interrupt" fn x87_floating_point_handler(frame: InterruptStackFrame) {
    panic!("x87 floating point exception at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!("alignment check (error={:#x}) at {:#x}", error_code, frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    panic!("MACHINE CHECK at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn simd_floating_point_handler(frame: InterruptStackFrame) {
    panic!("SIMD floating point exception at {:#x}", frame.instruction_pointer.as_u64());
}

const HARDIRQ_SAFE_TO_RESCHEDULE: bool = true;

/// Shared body for every dynamic (32..256) vector. `V` is baked in at
/// compile time by the `install_dynamic_vectors!` expansion below, so
/// `isr::dispatch` always gets a real, distinct vector number despite
/// there being one function body for all 224 of them.
extern "x86-interrupt" fn dynamic_handler<const V: u8>(_frame: InterruptStackFrame) {
    crate::per_cpu::hardirq_enter();

    if V == controller::RESCHEDULE_VECTOR {
        crate::per_cpu::set_need_resched();
        controller::eoi(0);
    } else if V == controller::TLB_SHOOTDOWN_VECTOR {
        crate::memory::tlb::handle_shootdown_ipi();
        controller::eoi(0);
    } else {
        isr::dispatch(V);
    }

    if crate::per_cpu::hardirq_exit() && HARDIRQ_SAFE_TO_RESCHEDULE {
        x86_64::instructions::interrupts::enable();
        crate::per_cpu::add_preempt_offset(crate::per_cpu::SOFTIRQ_OFFSET);
        softirq::do_pending();
        crate::per_cpu::sub_preempt_offset(crate::per_cpu::SOFTIRQ_OFFSET);
        x86_64::instructions::interrupts::disable();

        if crate::task::scheduler::is_running() && crate::per_cpu::need_resched() && crate::per_cpu::preempt_count() == 0 {
            crate::task::scheduler::schedule();
        }
    }
}

macro_rules! install_dynamic_vectors {
    ($idt:expr, $($v:literal),+ $(,)?) => {
        $(
            $idt[$v].set_handler_fn(dynamic_handler::<$v>);
        )+
    };
}

/// Build and load the IDT. Must run once, on the BSP, after `gdt::init`
/// (the double-fault and NMI handlers are bound to IST stacks gdt owns).
pub fn init() {
    IDT.try_init_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        unsafe {
            idt.non_maskable_interrupt.set_handler_fn(nmi_handler).set_stack_index(crate::gdt::NMI_IST_INDEX);
        }
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        unsafe {
            idt.double_fault.set_handler_fn(double_fault_handler).set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        // Virtualization-only exceptions (coprocessor segment overrun,
        // hv injection, vmm communication, security) are left at their
        // IDT-default entries: none of this kernel's target hardware
        // raises them.

        install_dynamic_vectors!(idt,32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95, 96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127, 128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143, 144, 145, 146, 147, 148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159, 160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175, 176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189, 190, 191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 202, 203, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223, 224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238, 239, 240, 241, 242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253, 254, 255);

        idt
    })
    .expect("idt already initialized");

    IDT.get().unwrap().load();
    softirq::init();
    log::info!("exceptions: idt loaded, {} dynamic vectors installed", isr::NUM_VECTORS - isr::FIRST_DYNAMIC_VECTOR);
}
