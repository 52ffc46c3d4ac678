//! IPC message representation
//!
//! Messages are register-borne: three words on the way in (Call, Send),
//! two on the way back (ReplyWait). No memory is shared or copied for
//! the fast path.
//!
//! # Wake-up register contract
//!
//! When a blocked thread is woken with a delivery, the kernel writes its
//! saved frame as follows:
//!
//! | Register | Receiver wake (Recv/ReplyWait) | Client wake (reply) |
//! |---|---|---|
//! | `rax` | message length (3) | 0 |
//! | `rdi` | badge of the invoked capability | 0 |
//! | `rsi` | message word 0 | reply word 0 |
//! | `rdx` | message word 1 | reply word 1 |
//! | `r10` | message word 2 | 0 |
//! | `r8`  | caller TID (0 for plain Send) | 0 |
//!
//! Every other scratch register is zero.

/// A three-word message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Message(pub [u64; 3]);

impl Message {
    /// Build a message from the three payload words.
    #[inline]
    #[must_use]
    pub const fn new(m0: u64, m1: u64, m2: u64) -> Self {
        Self([m0, m1, m2])
    }

    /// The payload words.
    #[inline]
    #[must_use]
    pub const fn words(&self) -> [u64; 3] {
        self.0
    }
}
