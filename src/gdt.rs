//! Global descriptor table and task state segment. One TSS per CPU, each
//! with a double-fault and an NMI IST slot so those two vectors always run
//! on a known-good stack regardless of what faulted.

use conquer_once::spin::OnceCell;
use x86_64::instructions::segmentation::{Segment, CS, DS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

static TSS: OnceCell<TaskStateSegment> = OnceCell::uninit();
static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

/// Initialize this CPU's GDT and TSS. `double_fault_stack_top` and
/// `nmi_stack_top` must each point at the top of a dedicated, never-reused
/// stack allocated by the memory subsystem.
pub fn init(double_fault_stack_top: VirtAddr, nmi_stack_top: VirtAddr) {
    TSS.init_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = double_fault_stack_top;
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] = nmi_stack_top;
        tss
    });

    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(TSS.get().unwrap()));
        (gdt, Selectors { kernel_code, kernel_data, user_code, user_data, tss })
    });

    let (gdt, selectors) = GDT.get().unwrap();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.kernel_code);
        DS::set_reg(selectors.kernel_data);
        load_tss(selectors.tss);
    }
    log::info!("gdt: loaded, kernel_code={:#x} tss={:#x}", selectors.kernel_code.0, selectors.tss.0);
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.get().expect("gdt not initialized").1.user_code
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.get().expect("gdt not initialized").1.user_data
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.get().expect("gdt not initialized").1.kernel_code
}

/// Refresh TSS.RSP0 (the ring-0 entry stack pointer) to the incoming
/// thread's trap-entry stack. Called on every context switch.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    // TaskStateSegment is not interior-mutable once loaded, but the CPU only
    // reads RSP0 out of the in-memory descriptor, so we mutate the cached
    // struct directly through a raw pointer obtained once at init.
    static RSP0_PTR: OnceCell<*mut VirtAddr> = OnceCell::uninit();
    let ptr = RSP0_PTR.try_get_or_init(|| {
        let tss = TSS.get().expect("tss not initialized") as *const TaskStateSegment as *mut TaskStateSegment;
        unsafe { &mut (*tss).privilege_stack_table[0] as *mut VirtAddr }
    });
    if let Ok(ptr) = ptr {
        unsafe { **ptr = stack_top };
    }
}
