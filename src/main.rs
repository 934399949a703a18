#![no_std]
#![no_main]

use bootloader_api::BootInfo;
use kernel::serial_println;
use kernel::task::thread::{self, KernelStack};
use kernel::task::{policy, process, scheduler};
use kernel::{gdt, interrupts, log_buffer, logger, memory, per_cpu, serial, task, time};
use log::LevelFilter;

bootloader_api::entry_point!(kernel_main);

/// The only CPU this loader's handoff actually brings up. `BootInfo` carries
/// no MADT/CPU descriptor list, so [`start_ap`] exists and is fully wired
/// but never called: there is nothing to discover an AP's `goto_address`
/// slot from without parsing ACPI tables, which is out of scope.
const BSP_CPU_ID: u32 = 0;

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init(LevelFilter::Info);
    log::info!("lunakern booting");

    let cmdline = ""; // no command-line source in this loader's handoff
    kernel::config::init(cmdline);
    logger::set_level(logger::level_from_cmdline(kernel::config::loglevel()));

    let hhdm_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory offset");
    let memory_regions = &boot_info.memory_regions;
    memory::init(hhdm_offset, memory_regions);

    per_cpu::init_this_cpu(BSP_CPU_ID);
    per_cpu::set_nr_cpus(1);

    let (df_top, nmi_top) = alloc_ist_stacks();
    gdt::init(df_top, nmi_top);

    time::init();
    interrupts::init();

    process::init_kernel_process();
    policy::init();
    task::init_this_cpu(BSP_CPU_ID, idle_entry);
    time::init_this_cpu(BSP_CPU_ID);

    log::info!("lunakern: boot complete on cpu {}, handing off to the idle thread", BSP_CPU_ID);
    scheduler::start()
}

/// Per-AP bring-up, in the same order `kernel_main` ran it for the BSP
/// minus the global, run-once steps (`memory::init`,
/// `process::init_kernel_process`, `policy::init`). Unreferenced under this
/// loader's handoff; see the `BSP_CPU_ID` doc comment.
#[allow(dead_code)]
fn start_ap(cpu_id: u32) -> ! {
    per_cpu::init_this_cpu(cpu_id);

    let (df_top, nmi_top) = alloc_ist_stacks();
    gdt::init(df_top, nmi_top);

    interrupts::init_this_cpu(cpu_id);
    time::init_this_cpu(cpu_id);
    task::init_this_cpu(cpu_id, idle_entry);
    scheduler::start()
}

/// The double-fault and NMI IST stacks are allocated once per CPU and kept
/// forever: `gdt::init` wires their top into the TSS, so dropping them
/// (which would `vunmap` the backing pages) is never safe.
fn alloc_ist_stacks() -> (x86_64::VirtAddr, x86_64::VirtAddr) {
    let df_stack = KernelStack::alloc(thread::KSTACK_SIZE).expect("failed to allocate double-fault stack");
    let df_top = df_stack.top;
    core::mem::forget(df_stack);

    let nmi_stack = KernelStack::alloc(thread::KSTACK_SIZE).expect("failed to allocate NMI stack");
    let nmi_top = nmi_stack.top;
    core::mem::forget(nmi_stack);

    (df_top, nmi_top)
}

extern "C" fn idle_entry(_arg: u64) -> ! {
    x86_64::instructions::interrupts::enable();
    loop {
        x86_64::instructions::hlt();
        scheduler::preempt_check();
    }
}

/// Walk a standard RBP-chain back from the panicking frame. No symbol table
/// is parsed here (the kernel ELF's symtab plumbing is out of scope), so
/// each frame prints its raw return address rather than a symbolized name.
fn dump_stack_trace() {
    serial_println!("-- stack trace --");
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp);
    }
    for depth in 0..32 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let return_addr = unsafe { *((rbp + 8) as *const u64) };
        if return_addr == 0 {
            break;
        }
        serial_println!("  #{:<2} {:#018x}", depth, return_addr);
        let next_rbp = unsafe { *(rbp as *const u64) };
        if next_rbp <= rbp {
            break;
        }
        rbp = next_rbp;
    }
}

fn dump_registers() {
    let (cr0, cr2, cr3, cr4): (u64, u64, u64, u64);
    unsafe {
        core::arch::asm!(
            "mov {0}, cr0",
            "mov {1}, cr2",
            "mov {2}, cr3",
            "mov {3}, cr4",
            out(reg) cr0, out(reg) cr2, out(reg) cr3, out(reg) cr4,
        );
    }
    serial_println!("cr0={:#x} cr2={:#x} cr3={:#x} cr4={:#x}", cr0, cr2, cr3, cr4);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    let cpu = if per_cpu::is_initialized() { per_cpu::cpu_id() as i64 } else { -1 };
    serial_println!("\n=== KERNEL PANIC (cpu {}) ===", cpu);
    serial_println!("{}", info);
    dump_registers();
    dump_stack_trace();
    log_buffer::dump();

    kernel::hlt_loop()
}
