//! Crate-wide error codes.
//!
//! The original kernel propagates small negative integers matching the
//! standard POSIX numbering where meaningful, encoded into the low bits of
//! a pointer-or-error return. Rust's `Result<T, Errno>` expresses the same
//! contract without the tagged-pointer encoding trick; every allocation- or
//! lookup-bearing operation here returns `Result<_, Errno>` instead.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Invalid argument.
    Inval = -22,
    /// Out of memory.
    NoMem = -12,
    /// No such entity.
    NoEnt = -2,
    /// Already exists.
    Exist = -17,
    /// Operation would block.
    WouldBlock = -11,
    /// Timed out.
    TimedOut = -110,
    /// Resource busy.
    Busy = -16,
    /// Operation not supported.
    NoSys = -38,
    /// Interrupted.
    Intr = -4,
    /// Value out of range.
    Range = -34,
    /// Bad address (user-copy fault).
    Fault = -14,
    /// No such device.
    NoDev = -19,
    /// Device not ready.
    NoTty = -25,
    /// Operation already in progress.
    InProgress = -115,
    /// Already in the requested state.
    Already = -114,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::Inval => "invalid argument",
            Errno::NoMem => "out of memory",
            Errno::NoEnt => "no such entity",
            Errno::Exist => "already exists",
            Errno::WouldBlock => "operation would block",
            Errno::TimedOut => "timed out",
            Errno::Busy => "resource busy",
            Errno::NoSys => "not supported",
            Errno::Intr => "interrupted",
            Errno::Range => "out of range",
            Errno::Fault => "bad address",
            Errno::NoDev => "no such device",
            Errno::NoTty => "not ready",
            Errno::InProgress => "operation in progress",
            Errno::Already => "already in requested state",
        };
        f.write_str(s)
    }
}

pub type KResult<T> = Result<T, Errno>;
