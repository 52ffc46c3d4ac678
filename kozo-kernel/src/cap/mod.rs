//! Kernel-side capability storage
//!
//! The capability engine in `kozo-cap` is storage-agnostic; this module
//! provides the storage: CNode slot arrays living in untyped-committed
//! frames, the untyped registry, and the boot-time seeding of the first
//! capabilities. It also implements the resource-reclamation hook that
//! revocation drives.

pub mod bootstrap;
pub mod space;

pub use space::{
    finish_reclaim, with_space, CNodeRegistry, CapSpace, KernelReclaim, PhysZero,
    UntypedRegistry, MAX_CNODES, MAX_UNTYPEDS,
};

use kozo_cap::CapError;
use kozo_syscall::SysError;

/// Map an engine error onto the ABI error codes.
#[must_use]
pub const fn cap_error_to_sys(e: CapError) -> SysError {
    match e {
        CapError::InvalidIndex => SysError::Invalid,
        CapError::EmptySlot => SysError::NoCap,
        CapError::TypeMismatch => SysError::NoCap,
        CapError::SlotOccupied => SysError::NoSpace,
        CapError::UntypedExhausted => SysError::NoSpace,
        CapError::RightsEscalation => SysError::AccessDenied,
        CapError::InsufficientRights => SysError::AccessDenied,
        CapError::OutOfMemory => SysError::NoMem,
        CapError::InvalidOperation => SysError::Invalid,
        CapError::InvalidState => SysError::InvalidState,
        CapError::TraversalLimit => SysError::InvalidState,
    }
}
