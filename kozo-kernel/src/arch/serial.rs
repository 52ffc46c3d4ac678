//! Serial console (UART 16550, COM1)
//!
//! Debug output only: the kernel's log sink during early boot and the
//! target of the DebugPutchar operation. Polled, no interrupts.

use core::fmt::{self, Write};

use spin::Mutex;
use x86_64::instructions::port::Port;

/// COM1 base port.
const COM1: u16 = 0x3F8;

/// A 16550 UART on an I/O port base.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    #[inline]
    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.base + offset)
    }

    /// Program 115200 8N1 with FIFOs enabled.
    pub fn init(&mut self) {
        // SAFETY: COM1 register writes with documented values.
        unsafe {
            self.port(1).write(0x00u8); // disable interrupts
            self.port(3).write(0x80u8); // DLAB on
            self.port(0).write(0x01u8); // divisor 1 = 115200 baud
            self.port(1).write(0x00u8);
            self.port(3).write(0x03u8); // 8 bits, no parity, one stop
            self.port(2).write(0xC7u8); // FIFO on, cleared, 14-byte threshold
            self.port(4).write(0x0Bu8); // DTR + RTS + OUT2
        }
    }

    #[inline]
    fn transmit_empty(&mut self) -> bool {
        // SAFETY: Line-status register read.
        unsafe { self.port(5).read() & 0x20 != 0 }
    }

    /// Write one byte, spinning until the transmitter is ready.
    pub fn write_byte(&mut self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        // SAFETY: Data-register write.
        unsafe {
            self.port(0).write(byte);
        }
    }

    fn write_bytes(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s);
        Ok(())
    }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Initialise COM1.
pub fn init() {
    SERIAL.lock().init();
}

/// Write one byte to the console.
pub fn putc(byte: u8) {
    SERIAL.lock().write_byte(byte);
}

/// Write a string to the console.
pub fn puts(s: &str) {
    SERIAL.lock().write_bytes(s);
}

/// Write formatted output to the console.
pub fn write_fmt(args: fmt::Arguments) {
    let _ = SERIAL.lock().write_fmt(args);
}
