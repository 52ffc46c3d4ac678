//! Operation numbers
//!
//! The kernel exposes a numbered operation surface; numbers are stable ABI
//! and grouped by category with gaps for growth. The dispatcher accepts
//! numbers in `1..MAX_SYSCALL` only.

/// Exclusive upper bound on valid operation numbers.
pub const MAX_SYSCALL: u64 = 100;

/// Kernel operations.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sys {
    // === Capability management (1-6) ===
    /// Create a capability from untyped memory (single-object retype).
    CapCreate = 1,
    /// Remove a capability from its slot without destroying derivatives.
    CapDelete = 2,
    /// Destroy a capability and its entire derivation subtree.
    CapRevoke = 3,
    /// Copy or move a capability to another CNode slot.
    CapTransfer = 4,
    /// Derive an attenuated capability with a fresh badge.
    CapMint = 5,
    /// Check a capability's badge (constant time).
    CapVerify = 6,

    // === IPC (10-13) ===
    /// Send a three-word message; fails with WouldBlock if no receiver waits.
    IpcSend = 10,
    /// Block until a message arrives; badge lands in the first argument register.
    IpcRecv = 11,
    /// Send and wait for the reply, direct-switching to a waiting receiver.
    IpcCall = 12,
    /// Reply to the previous caller, then wait for the next message.
    IpcReplyWait = 13,

    // === Memory (20-22) ===
    /// Retype untyped memory into `count` new kernel objects.
    Retype = 20,
    /// Map a frame capability into the caller's address space.
    MapFrame = 21,
    /// Remove a frame mapping.
    UnmapFrame = 22,

    // === Threads (30-33) ===
    /// Create a thread in the given address space; returns its capability slot.
    ThreadCreate = 30,
    /// Make a suspended thread runnable.
    ThreadResume = 31,
    /// Suspend a thread.
    ThreadSuspend = 32,
    /// Set a thread's priority (cannot exceed the caller's own).
    ThreadSetPriority = 33,

    // === Endpoints and naming (40-42) ===
    /// Retype an Untyped region into a fresh endpoint.
    EndpointCreate = 40,
    /// Destroy an endpoint, waking every queued thread with an error.
    EndpointDelete = 41,
    /// Register an endpoint under a name in the system namespace.
    NamespaceRegister = 42,

    // === Debug (98-99) ===
    /// Log the caller's occupied capability slots.
    DebugDumpCaps = 98,
    /// Write one byte to the kernel console.
    DebugPutchar = 99,
}

impl Sys {
    /// Decode an operation number.
    #[must_use]
    pub const fn from_number(n: u64) -> Option<Self> {
        Some(match n {
            1 => Self::CapCreate,
            2 => Self::CapDelete,
            3 => Self::CapRevoke,
            4 => Self::CapTransfer,
            5 => Self::CapMint,
            6 => Self::CapVerify,
            10 => Self::IpcSend,
            11 => Self::IpcRecv,
            12 => Self::IpcCall,
            13 => Self::IpcReplyWait,
            20 => Self::Retype,
            21 => Self::MapFrame,
            22 => Self::UnmapFrame,
            30 => Self::ThreadCreate,
            31 => Self::ThreadResume,
            32 => Self::ThreadSuspend,
            33 => Self::ThreadSetPriority,
            40 => Self::EndpointCreate,
            41 => Self::EndpointDelete,
            42 => Self::NamespaceRegister,
            98 => Self::DebugDumpCaps,
            99 => Self::DebugPutchar,
            _ => return None,
        })
    }

    /// Operation name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CapCreate => "CapCreate",
            Self::CapDelete => "CapDelete",
            Self::CapRevoke => "CapRevoke",
            Self::CapTransfer => "CapTransfer",
            Self::CapMint => "CapMint",
            Self::CapVerify => "CapVerify",
            Self::IpcSend => "IpcSend",
            Self::IpcRecv => "IpcRecv",
            Self::IpcCall => "IpcCall",
            Self::IpcReplyWait => "IpcReplyWait",
            Self::Retype => "Retype",
            Self::MapFrame => "MapFrame",
            Self::UnmapFrame => "UnmapFrame",
            Self::ThreadCreate => "ThreadCreate",
            Self::ThreadResume => "ThreadResume",
            Self::ThreadSuspend => "ThreadSuspend",
            Self::ThreadSetPriority => "ThreadSetPriority",
            Self::EndpointCreate => "EndpointCreate",
            Self::EndpointDelete => "EndpointDelete",
            Self::NamespaceRegister => "NamespaceRegister",
            Self::DebugDumpCaps => "DebugDumpCaps",
            Self::DebugPutchar => "DebugPutchar",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for n in 0..MAX_SYSCALL {
            if let Some(s) = Sys::from_number(n) {
                assert_eq!(s as u64, n);
            }
        }
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(Sys::from_number(0).is_none());
        assert!(Sys::from_number(7).is_none());
        assert!(Sys::from_number(100).is_none());
        assert!(Sys::from_number(u64::MAX).is_none());
    }
}
