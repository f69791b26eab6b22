use core::fmt;

use spinning_top::Spinlock;
use x86_64::instructions::port::Port;

pub const HEADING_PREFIX: &str =    "[kernel] ";
pub const SUBHEADING_PREFIX: &str = "       - ";

// COM1 16550 registers
const SERIAL_BASE: u16 = 0x3F8;
const SERIAL_DATA: u16 = SERIAL_BASE;
const SERIAL_INT_ENABLE: u16 = SERIAL_BASE + 1;
const SERIAL_FIFO_CTRL: u16 = SERIAL_BASE + 2;
const SERIAL_LINE_CTRL: u16 = SERIAL_BASE + 3;
const SERIAL_MODEM_CTRL: u16 = SERIAL_BASE + 4;
const SERIAL_LINE_STATUS: u16 = SERIAL_BASE + 5;

struct DebugPrinter {
    data: Port<u8>,
    line_status: Port<u8>,
}

impl DebugPrinter {
    pub fn new() -> Self {
        let mut int_enable = Port::<u8>::new(SERIAL_INT_ENABLE);
        let mut fifo_ctrl = Port::<u8>::new(SERIAL_FIFO_CTRL);
        let mut line_ctrl = Port::<u8>::new(SERIAL_LINE_CTRL);
        let mut modem_ctrl = Port::<u8>::new(SERIAL_MODEM_CTRL);
        let mut data = Port::<u8>::new(SERIAL_DATA);

        unsafe {
            int_enable.write(0x00);  // No serial interrupts, we poll
            line_ctrl.write(0x80);   // DLAB on to set the divisor
            data.write(0x01);        // 115200 baud (divisor 1)
            int_enable.write(0x00);
            line_ctrl.write(0x03);   // 8 data bits, no parity, 1 stop bit
            fifo_ctrl.write(0xC7);   // FIFOs on and cleared
            modem_ctrl.write(0x03);  // DTR + RTS
        }

        Self {
            data,
            line_status: Port::new(SERIAL_LINE_STATUS),
        }
    }

    pub fn print_char(&mut self, c: char) {
        let mut buf = [0_u8; 4];

        for &byte in c.encode_utf8(&mut buf).as_bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }

            self.put_byte(byte);
        }
    }

    fn put_byte(&mut self, byte: u8) {
        unsafe {
            // Wait for the transmit holding register to drain
            while self.line_status.read() & 0x20 == 0 {}

            self.data.write(byte);
        }
    }
}

static DEBUG_PRINTER: Spinlock<Option<DebugPrinter>> = Spinlock::new(None);

pub fn init() {
    *DEBUG_PRINTER.lock() = Some(DebugPrinter::new());
}

struct DebugPrintHelper;

impl fmt::Write for DebugPrintHelper {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut printer = DEBUG_PRINTER.lock();

        if let Some(printer) = printer.as_mut() {
            for c in s.chars() {
                printer.print_char(c);
            }
        }

        Ok(())
    }
}

pub fn debug_print_helper(args: fmt::Arguments) {
    let _ = fmt::write(&mut DebugPrintHelper, args);
}

#[macro_export]
macro_rules! debug_print {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::debug_print!("{}{}", $prefix, format_args!($($arg)*));
    };

    ($($arg:tt)*) => {
        $crate::debug_print::debug_print_helper(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug_println {
    () => {
        $crate::debug_println!("")
    };

    ($prefix:expr; $($arg:tt)*) => {
        $crate::debug_print!("{}{}\n", $prefix, format_args!($($arg)*))
    };

    ($($arg:tt)*) => {
        $crate::debug_print!("{}\n", format_args!($($arg)*))
    };
}
