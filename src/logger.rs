//! `log` crate backend. Writes to the serial console, tagged with the
//! two-byte level prefix and the `[SSSSS.uuuuuu]` boot-relative timestamp
//! described in the command-line/log-format contract, and mirrors
//! warn-and-above records into the panic-time ring buffer.

use core::sync::atomic::{AtomicU8, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Two-byte prefixes recognized on pre-formatted strings passed to `printk`
/// style call sites (`\x01<level>`), per the external log-format contract.
pub const PREFIX_EMERG: u8 = 1;
pub const PREFIX_CRIT: u8 = 2;
pub const PREFIX_ERR: u8 = 3;
pub const PREFIX_WARN: u8 = 4;
pub const PREFIX_INFO: u8 = 5;
pub const PREFIX_DBG: u8 = 6;

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        (metadata.level() as u8) <= CURRENT_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (secs, micros) = crate::time::uptime_secs_micros();
        crate::serial_println!(
            "[{:>5}.{:06}] {:<5} {}: {}",
            secs,
            micros,
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= Level::Warn {
            crate::log_buffer::record(record.level(), *record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Must run after `serial::init()`; may run before the
/// timekeeper is selected (uptime reads zero until then).
pub fn init(level: LevelFilter) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .expect("logger already initialized");
}

pub fn set_level(level: LevelFilter) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
    log::set_max_level(level);
}

/// Map the command-line `loglevel` numeral (1 emerg .. 6 dbg) onto a
/// `LevelFilter`, per the external command-line contract.
pub fn level_from_cmdline(n: u8) -> LevelFilter {
    match n {
        0 | 1 => LevelFilter::Error,
        2 => LevelFilter::Error,
        3 => LevelFilter::Error,
        4 => LevelFilter::Warn,
        5 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}
