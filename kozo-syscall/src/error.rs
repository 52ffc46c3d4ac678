//! ABI error codes
//!
//! Every error kind is a distinct negative return value. Errors surface
//! only to the invoking thread; they never cross threads.

use core::fmt;

/// Kernel operation error codes.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SysError {
    /// Malformed arguments or unknown operation number.
    Invalid = -1,
    /// The referenced slot is empty or holds the wrong capability type.
    NoCap = -2,
    /// Physical memory or a fixed kernel pool is exhausted.
    NoMem = -3,
    /// The capability lacks a required right, or a priority escalation
    /// was attempted.
    AccessDenied = -4,
    /// Destination slot occupied, or untyped region too small.
    NoSpace = -5,
    /// The object is not in the state the operation expects, or the
    /// endpoint was revoked while the thread waited on it.
    InvalidState = -6,
    /// A non-blocking operation found an empty queue.
    WouldBlock = -7,
    /// `ReplyWait` named a thread that is not awaiting a reply.
    NoCaller = -8,
}

impl SysError {
    /// Raw return value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Decode a raw negative return value.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            -1 => Self::Invalid,
            -2 => Self::NoCap,
            -3 => Self::NoMem,
            -4 => Self::AccessDenied,
            -5 => Self::NoSpace,
            -6 => Self::InvalidState,
            -7 => Self::WouldBlock,
            -8 => Self::NoCaller,
            _ => return None,
        })
    }

    /// Error name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::NoCap => "NoCap",
            Self::NoMem => "NoMem",
            Self::AccessDenied => "AccessDenied",
            Self::NoSpace => "NoSpace",
            Self::InvalidState => "InvalidState",
            Self::WouldBlock => "WouldBlock",
            Self::NoCaller => "NoCaller",
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of a kernel operation.
pub type SysResult<T> = Result<T, SysError>;

/// Interpret a raw syscall return value.
#[inline]
pub fn decode(raw: i64) -> SysResult<u64> {
    if raw >= 0 {
        Ok(raw as u64)
    } else {
        Err(SysError::from_raw(raw).unwrap_or(SysError::Invalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for raw in -8..0 {
            let e = SysError::from_raw(raw).unwrap();
            assert_eq!(e.as_i64(), raw);
        }
        assert!(SysError::from_raw(-9).is_none());
        assert!(SysError::from_raw(0).is_none());
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(42), Ok(42));
        assert_eq!(decode(0), Ok(0));
        assert_eq!(decode(-7), Err(SysError::WouldBlock));
        assert_eq!(decode(-99), Err(SysError::Invalid));
    }
}
