//! Byte-wise moves against untrusted (userspace) addresses. Every access
//! is a single instruction whose address is registered, on first use,
//! into a runtime exception table alongside a fixup address; a fault at
//! that instruction transfers control to the fixup instead of escalating
//! into a kernel panic. The page-fault trap consults [`lookup_fixup`]
//! before treating a fault as fatal.

use alloc::vec::Vec;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Errno, KResult};
use crate::sync::spinlock::SpinLockIrq;

/// Top bit clear: addresses at or above this are kernel addresses and are
/// never legal targets for these primitives.
const USER_ADDR_LIMIT: u64 = 0x0000_8000_0000_0000;

static EX_TABLE: SpinLockIrq<Vec<(u64, u64)>> = SpinLockIrq::new(Vec::new());

/// Called from the page-fault handler before it decides whether a fault
/// is fatal. Returns the RIP to resume at if `fault_rip` is a registered
/// usercopy access point.
pub fn lookup_fixup(fault_rip: u64) -> Option<u64> {
    let table = EX_TABLE.lock();
    table.iter().find(|(f, _)| *f == fault_rip).map(|(_, fixup)| *fixup)
}

fn register_fixup(fault_rip: u64, fixup_rip: u64) {
    let mut table = EX_TABLE.lock();
    if !table.iter().any(|(f, _)| *f == fault_rip) {
        table.push((fault_rip, fixup_rip));
    }
}

static EARLY_IN_USERCOPY: AtomicBool = AtomicBool::new(false);

/// Per-thread marker consulted by the page-fault path to tell a genuine
/// usercopy fault apart from a kernel bug accessing user memory directly.
fn set_in_usercopy(value: bool) {
    let t = crate::per_cpu::current_thread_ptr();
    if t.is_null() {
        EARLY_IN_USERCOPY.store(value, Ordering::Release);
    } else {
        unsafe { (*t).in_usercopy.store(value, Ordering::Release) };
    }
}

pub fn in_usercopy() -> bool {
    let t = crate::per_cpu::current_thread_ptr();
    if t.is_null() {
        EARLY_IN_USERCOPY.load(Ordering::Acquire)
    } else {
        unsafe { (*t).in_usercopy.load(Ordering::Acquire) }
    }
}

fn in_range(addr: u64, len: u64) -> bool {
    addr < USER_ADDR_LIMIT && addr.checked_add(len).map(|end| end <= USER_ADDR_LIMIT).unwrap_or(false)
}

/// Read one byte from `src`, registering the access instruction's address
/// with its fixup on first use. Returns `Err` on a fault.
fn read_user_byte(src: *const u8) -> Result<u8, ()> {
    let value: u8;
    let faulted: u64;
    let fault_rip: u64;
    let fixup_rip: u64;
    unsafe {
        asm!(
            "lea {fault_rip}, [2f + rip]",
            "lea {fixup_rip}, [3f + rip]",
            "mov {faulted:e}, 0",
            "2:",
            "mov {val}, byte ptr [{src}]",
            "jmp 4f",
            "3:",
            "mov {faulted:e}, 1",
            "4:",
            src = in(reg) src,
            val = out(reg_byte) value,
            faulted = out(reg) faulted,
            fault_rip = out(reg) fault_rip,
            fixup_rip = out(reg) fixup_rip,
        );
    }
    register_fixup(fault_rip, fixup_rip);
    if faulted != 0 {
        Err(())
    } else {
        Ok(value)
    }
}

/// Write one byte to `dst`, registering the access instruction's address
/// with its fixup on first use. Returns `Err` on a fault.
fn write_user_byte(dst: *mut u8, val: u8) -> Result<(), ()> {
    let faulted: u64;
    let fault_rip: u64;
    let fixup_rip: u64;
    unsafe {
        asm!(
            "lea {fault_rip}, [2f + rip]",
            "lea {fixup_rip}, [3f + rip]",
            "mov {faulted:e}, 0",
            "2:",
            "mov byte ptr [{dst}], {val}",
            "jmp 4f",
            "3:",
            "mov {faulted:e}, 1",
            "4:",
            dst = in(reg) dst,
            val = in(reg_byte) val,
            faulted = out(reg) faulted,
            fault_rip = out(reg) fault_rip,
            fixup_rip = out(reg) fixup_rip,
        );
    }
    register_fixup(fault_rip, fixup_rip);
    if faulted != 0 {
        Err(())
    } else {
        Ok(())
    }
}

/// Copy `len` bytes from the user address `src` into the kernel buffer
/// `dst`.
pub fn usercopy_from_user(dst: &mut [u8], src: u64, len: usize) -> KResult<()> {
    if !in_range(src, len as u64) || dst.len() < len {
        return Err(Errno::Fault);
    }
    set_in_usercopy(true);
    let result = (|| {
        for (i, slot) in dst.iter_mut().enumerate().take(len) {
            *slot = read_user_byte((src as usize + i) as *const u8).map_err(|_| Errno::Fault)?;
        }
        Ok(())
    })();
    set_in_usercopy(false);
    result
}

/// Copy `len` bytes from the kernel buffer `src` to the user address
/// `dst`.
pub fn usercopy_to_user(dst: u64, src: &[u8], len: usize) -> KResult<()> {
    if !in_range(dst, len as u64) || src.len() < len {
        return Err(Errno::Fault);
    }
    set_in_usercopy(true);
    let result = (|| {
        for (i, byte) in src.iter().enumerate().take(len) {
            write_user_byte((dst as usize + i) as *mut u8, *byte).map_err(|_| Errno::Fault)?;
        }
        Ok(())
    })();
    set_in_usercopy(false);
    result
}

/// Fill `len` bytes at the user address `dst` with `val`.
pub fn usercopy_memset(dst: u64, val: u8, len: usize) -> KResult<()> {
    if !in_range(dst, len as u64) {
        return Err(Errno::Fault);
    }
    set_in_usercopy(true);
    let result = (|| {
        for i in 0..len {
            write_user_byte((dst as usize + i) as *mut u8, val).map_err(|_| Errno::Fault)?;
        }
        Ok(())
    })();
    set_in_usercopy(false);
    result
}

/// Measure a NUL-terminated string at the user address `src`, up to
/// `max_len` bytes (exclusive of the terminator).
pub fn usercopy_strlen(src: u64, max_len: usize) -> KResult<usize> {
    if !in_range(src, 1) {
        return Err(Errno::Fault);
    }
    set_in_usercopy(true);
    let result = (|| {
        for i in 0..max_len {
            let byte = read_user_byte((src as usize + i) as *const u8).map_err(|_| Errno::Fault)?;
            if byte == 0 {
                return Ok(i);
            }
        }
        Ok(max_len)
    })();
    set_in_usercopy(false);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_kernel_half_addresses() {
        assert!(!in_range(USER_ADDR_LIMIT, 1));
        assert!(!in_range(u64::MAX - 4, 8));
    }

    #[test]
    fn accepts_plausible_user_address() {
        assert!(in_range(0x1000, 0x1000));
    }
}
