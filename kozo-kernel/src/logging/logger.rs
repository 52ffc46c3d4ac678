//! Kernel logger
//!
//! Implements the `log` facade: messages are formatted into a stack
//! buffer (no allocation anywhere on the path), pushed into the ring
//! buffer, and mirrored to the serial console while the early console is
//! enabled.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use super::buffer::{self, LOG_ENTRY_CONTENT_SIZE};
use crate::arch::serial;

/// Fixed-size formatting target.
struct MessageBuffer {
    data: [u8; LOG_ENTRY_CONTENT_SIZE],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0; LOG_ENTRY_CONTENT_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(LOG_ENTRY_CONTENT_SIZE - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut msg = MessageBuffer::new();
        let _ = write!(msg, "{}", record.args());

        let seq = buffer::push(record.level() as u8, msg.as_str());

        if buffer::early_console_enabled() {
            let level_str = match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33m WARN\x1b[0m",
                Level::Info => "\x1b[32m INFO\x1b[0m",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            };
            let mut line = MessageBuffer::new();
            let _ = write!(line, "[{seq:6}] {} {}: ", level_str, record.target());
            serial::puts(line.as_str());
            serial::puts(msg.as_str());
            serial::puts("\n");
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the logger. Serial must be initialised first.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}
