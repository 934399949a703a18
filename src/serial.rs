//! Serial console (COM1, 16550 UART) used for all kernel log output.

use core::fmt;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1_PORT: u16 = 0x3F8;

pub static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_PORT) });

pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial failed");
    });
}

/// Write without taking the lock — only used by the panic path, which may
/// run with the lock already held by the faulting context.
pub fn emergency_print(args: fmt::Arguments) {
    use core::fmt::Write;

    struct Emergency;
    impl fmt::Write for Emergency {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let mut port: x86_64::instructions::port::Port<u8> = x86_64::instructions::port::Port::new(COM1_PORT);
            for byte in s.bytes() {
                unsafe { port.write(byte) };
            }
            Ok(())
        }
    }
    let _ = Emergency.write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
