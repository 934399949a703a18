//! In-memory ring buffer mirroring warn-and-above log records, so a panic
//! handler can dump recent history even if the serial link itself is what
//! is misbehaving.

use spin::Mutex;

const CAPACITY: usize = 64;
const LINE_LEN: usize = 120;

struct Line {
    buf: [u8; LINE_LEN],
    len: usize,
}

impl Line {
    const fn empty() -> Self {
        Line { buf: [0; LINE_LEN], len: 0 }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8>")
    }
}

struct RingBuffer {
    lines: [Line; CAPACITY],
    next: usize,
    filled: bool,
}

static BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer {
    lines: [const { Line::empty() }; CAPACITY],
    next: 0,
    filled: false,
});

pub fn record(level: log::Level, args: core::fmt::Arguments) {
    use core::fmt::Write;

    struct Cursor<'a> {
        buf: &'a mut [u8],
        len: usize,
    }
    impl<'a> Write for Cursor<'a> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for b in s.bytes() {
                if self.len >= self.buf.len() {
                    break;
                }
                self.buf[self.len] = b;
                self.len += 1;
            }
            Ok(())
        }
    }

    let mut guard = BUFFER.lock();
    let idx = guard.next;
    guard.lines[idx] = Line::empty();
    {
        let mut cursor = Cursor { buf: &mut guard.lines[idx].buf, len: 0 };
        let _ = write!(cursor, "[{}] {}", level, args);
        let written = cursor.len;
        guard.lines[idx].len = written;
    }
    guard.next = (guard.next + 1) % CAPACITY;
    if guard.next == 0 {
        guard.filled = true;
    }
}

/// Dump the ring buffer to serial in chronological order. Called only from
/// the panic path, after the normal logger may already be unreliable.
pub fn dump() {
    let guard = BUFFER.lock();
    let count = if guard.filled { CAPACITY } else { guard.next };
    let start = if guard.filled { guard.next } else { 0 };
    crate::serial_println!("-- recent log history ({} lines) --", count);
    for i in 0..count {
        let idx = (start + i) % CAPACITY;
        crate::serial_println!("{}", guard.lines[idx].as_str());
    }
}
