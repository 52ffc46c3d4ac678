//! Capability error types

use core::fmt;

/// Errors from capability operations.
///
/// Every operation in [`ops`](crate::ops) returns `Result<T, CapError>`.
/// The kernel maps these onto the ABI error codes at the syscall boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "capability errors must be handled"]
pub enum CapError {
    /// The slot index is out of bounds, or the CNode does not exist.
    InvalidIndex,

    /// The source slot is empty.
    EmptySlot,

    /// The destination slot is already occupied.
    ///
    /// Capabilities never overwrite each other; delete the occupant first.
    SlotOccupied,

    /// The operation would widen rights.
    ///
    /// Rights can only be attenuated, never escalated.
    RightsEscalation,

    /// The capability lacks a right the operation requires.
    InsufficientRights,

    /// The capability's object type does not fit the operation.
    TypeMismatch,

    /// No free object-table entry or CNode registry entry.
    OutOfMemory,

    /// The untyped region has too few remaining bytes.
    UntypedExhausted,

    /// The operation is not defined for this object type.
    InvalidOperation,

    /// The object is not in a state that permits the operation.
    InvalidState,

    /// Revocation traversal hit its step bound.
    ///
    /// Indicates a malformed derivation structure (e.g. a link cycle);
    /// the tree is left partially revoked and the kernel should treat
    /// this as a fatal consistency failure.
    TraversalLimit,
}

impl CapError {
    /// Short description.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidIndex => "invalid slot index",
            Self::EmptySlot => "slot is empty",
            Self::SlotOccupied => "destination slot is occupied",
            Self::RightsEscalation => "cannot widen capability rights",
            Self::InsufficientRights => "insufficient rights for operation",
            Self::TypeMismatch => "object type mismatch",
            Self::OutOfMemory => "out of kernel objects or slots",
            Self::UntypedExhausted => "untyped memory exhausted",
            Self::InvalidOperation => "operation not defined for object type",
            Self::InvalidState => "invalid state for operation",
            Self::TraversalLimit => "revocation traversal limit exceeded",
        }
    }
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type for capability operations.
pub type CapResult<T> = Result<T, CapError>;
