//! Full-register-save context switching. The timer interrupt handler and
//! every voluntary `schedule()` path call the same [`switch`] routine, so
//! the trap frame beneath a preempted thread's switch-in stack is always
//! intact: resuming it later simply falls back out through the same
//! `extern "x86-interrupt"` epilogue that was running when it was cut off.

use core::arch::global_asm;

use crate::task::thread::{CpuContext, Thread};

global_asm!(r#"
.global switch_context
.global switch_to_thread

// switch_context(old: *mut CpuContext, new: *const CpuContext)
// rdi = old, rsi = new
switch_context:
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], rsi
    mov [rdi + 0x28], rdi
    mov [rdi + 0x30], rbp
    mov [rdi + 0x38], rsp
    mov [rdi + 0x40], r8
    mov [rdi + 0x48], r9
    mov [rdi + 0x50], r10
    mov [rdi + 0x58], r11
    mov [rdi + 0x60], r12
    mov [rdi + 0x68], r13
    mov [rdi + 0x70], r14
    mov [rdi + 0x78], r15

    mov rax, [rsp]
    mov [rdi + 0x80], rax

    pushfq
    pop rax
    mov [rdi + 0x88], rax

    mov rax, [rsi + 0x88]
    push rax
    popfq

    mov rax, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rcx, [rsi + 0x10]
    mov rdx, [rsi + 0x18]
    mov rbp, [rsi + 0x30]
    mov r8,  [rsi + 0x40]
    mov r9,  [rsi + 0x48]
    mov r10, [rsi + 0x50]
    mov r11, [rsi + 0x58]
    mov r12, [rsi + 0x60]
    mov r13, [rsi + 0x68]
    mov r14, [rsi + 0x70]
    mov r15, [rsi + 0x78]

    mov rax, [rsi + 0x80]
    mov rsp, [rsi + 0x38]

    mov rdi, [rsi + 0x28]
    mov rsi, [rsi + 0x20]

    jmp rax

// switch_to_thread(new: *const CpuContext) -> !
// rdi = new
switch_to_thread:
    mov rax, [rdi + 0x88]
    push rax
    popfq

    mov rax, [rdi + 0x00]
    mov rbx, [rdi + 0x08]
    mov rcx, [rdi + 0x10]
    mov rdx, [rdi + 0x18]
    mov rsi, [rdi + 0x20]
    mov rbp, [rdi + 0x30]
    mov rsp, [rdi + 0x38]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]

    mov rax, [rdi + 0x80]
    mov rdi, [rdi + 0x28]

    jmp rax
"#);

extern "C" {
    fn switch_context(old: *mut CpuContext, new: *const CpuContext);
    fn switch_to_thread(new: *const CpuContext) -> !;
}

/// 512-byte legacy FXSAVE area; SSE state only (no AVX/XSAVE) matching the
/// extended-state buffer each thread carries in `ext_state`.
unsafe fn fxsave(area: *mut u8) {
    unsafe {
        core::arch::asm!("fxsave [{0}]", in(reg) area, options(nostack));
    }
}

unsafe fn fxrstor(area: *const u8) {
    unsafe {
        core::arch::asm!("fxrstor [{0}]", in(reg) area, options(nostack));
    }
}

/// Switch from `old` to `new`: save `old`'s extended state and GP
/// registers, refresh the TSS RSP0 to `new`'s trap-entry stack, restore
/// `new`'s extended state, then hand control to it via `switch_context`.
///
/// # Safety
/// `old` and `new` must both be valid, live `Thread`s, and the caller must
/// hold whatever lock protects the runqueue's notion of "current" for the
/// duration of the switch (interrupts must already be disabled: this
/// function does not disable them itself).
pub unsafe fn switch(old: *mut Thread, new: *mut Thread) {
    unsafe {
        if !(*old).ext_state.is_null() {
            fxsave((*old).ext_state);
        }
        if (*new).utk_stack.as_u64() != 0 {
            crate::gdt::set_kernel_stack((*new).utk_stack);
        } else {
            crate::gdt::set_kernel_stack((*new).kernel_stack.top);
        }
        if !(*new).ext_state.is_null() {
            fxrstor((*new).ext_state);
        }
        switch_context(&mut (*old).context as *mut CpuContext, &(*new).context as *const CpuContext);
    }
}

/// First switch into a thread on this CPU: there is no "old" context to
/// save (this call never returns to its caller).
///
/// # Safety
/// `new` must be a valid, live `Thread` whose context has been fully
/// initialized (e.g. via `CpuContext::new_kthread`).
pub unsafe fn switch_to_first(new: *mut Thread) -> ! {
    unsafe {
        if (*new).utk_stack.as_u64() != 0 {
            crate::gdt::set_kernel_stack((*new).utk_stack);
        } else {
            crate::gdt::set_kernel_stack((*new).kernel_stack.top);
        }
        if !(*new).ext_state.is_null() {
            fxrstor((*new).ext_state);
        }
        switch_to_thread(&(*new).context as *const CpuContext)
    }
}
