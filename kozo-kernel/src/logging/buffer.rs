//! Log ring buffer
//!
//! Formatted log entries land in a fixed ring so a user-mode console
//! service can drain them once it exists; during early boot they are
//! mirrored to the serial port. The ring overwrites its oldest entries
//! when full — losing old diagnostics beats blocking the kernel.
//!
//! Single processor with preemption off means the mutex is never
//! contended; it exists to give the borrow checker a structure.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

/// Bytes of message text per entry.
pub const LOG_ENTRY_CONTENT_SIZE: usize = 120;

/// Number of entries in the ring.
pub const LOG_BUFFER_ENTRIES: usize = 256;

/// One formatted log record.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Numeric log level (1 = error .. 5 = trace).
    pub level: u8,
    /// Used bytes of `text`.
    pub len: u8,
    /// Message bytes (truncated to the entry size).
    pub text: [u8; LOG_ENTRY_CONTENT_SIZE],
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            seq: 0,
            level: 0,
            len: 0,
            text: [0; LOG_ENTRY_CONTENT_SIZE],
        }
    }

    /// Build an entry from a level and message text.
    #[must_use]
    pub fn new(seq: u64, level: u8, message: &str) -> Self {
        let mut entry = Self::empty();
        entry.seq = seq;
        entry.level = level;
        let len = message.len().min(LOG_ENTRY_CONTENT_SIZE);
        entry.text[..len].copy_from_slice(&message.as_bytes()[..len]);
        entry.len = len as u8;
        entry
    }

    /// Message text.
    #[must_use]
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.text[..self.len as usize]).unwrap_or("<invalid>")
    }
}

struct Ring {
    entries: [LogEntry; LOG_BUFFER_ENTRIES],
    next: usize,
    seq: u64,
}

static RING: Mutex<Ring> = Mutex::new(Ring {
    entries: [LogEntry::empty(); LOG_BUFFER_ENTRIES],
    next: 0,
    seq: 0,
});

static EARLY_CONSOLE: AtomicBool = AtomicBool::new(true);

/// Append a message; returns its sequence number.
pub fn push(level: u8, message: &str) -> u64 {
    let mut ring = RING.lock();
    ring.seq += 1;
    let seq = ring.seq;
    let next = ring.next;
    ring.entries[next] = LogEntry::new(seq, level, message);
    ring.next = (next + 1) % LOG_BUFFER_ENTRIES;
    seq
}

/// Check if log output should be mirrored to the serial console.
#[must_use]
pub fn early_console_enabled() -> bool {
    EARLY_CONSOLE.load(Ordering::Relaxed)
}

/// Stop mirroring to the serial console (a user console took over).
pub fn disable_early_console() {
    EARLY_CONSOLE.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_truncation() {
        let long = "x".repeat(500);
        let e = LogEntry::new(1, 3, &long);
        assert_eq!(e.len as usize, LOG_ENTRY_CONTENT_SIZE);
        assert_eq!(e.text().len(), LOG_ENTRY_CONTENT_SIZE);
    }

    #[test]
    fn test_sequence_increments() {
        let a = push(3, "one");
        let b = push(3, "two");
        assert!(b > a);
    }
}
