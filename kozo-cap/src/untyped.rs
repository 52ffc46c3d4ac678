//! Untyped memory
//!
//! Untyped memory is the raw material of the capability system: a
//! contiguous physical region with no kernel-object interpretation.
//! Retype converts a prefix of it into typed objects, one way.
//!
//! # Watermark
//!
//! Each untyped region carries a watermark (byte offset) that only moves
//! forward: bytes below it are committed to retyped children, bytes above
//! are unused. The watermark resets to zero only when the last live child
//! is destroyed, because a bump allocator cannot reuse interior holes.

use core::fmt;

use kozo_common::PhysAddr;

use crate::cnode::CNODE_SLOTS;
use crate::error::CapError;
use crate::slot::ObjectType;

/// Untyped memory object metadata.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct UntypedObject {
    /// Physical base address of the region.
    pub base: PhysAddr,
    /// Total size in bytes.
    pub size: u64,
    /// Offset of the first uncommitted byte.
    pub watermark: u64,
    /// Bytes currently committed to live children.
    ///
    /// Decremented when a child is revoked; when it reaches zero the
    /// watermark resets and the whole region becomes available again.
    pub live_bytes: u64,
}

impl UntypedObject {
    /// Create a new untyped region.
    #[inline]
    #[must_use]
    pub const fn new(base: PhysAddr, size: u64) -> Self {
        Self {
            base,
            size,
            watermark: 0,
            live_bytes: 0,
        }
    }

    /// An empty placeholder entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(PhysAddr::new(0), 0)
    }

    /// Bytes remaining above the watermark.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.size.saturating_sub(self.watermark)
    }

    /// Check if the region is fully committed.
    #[inline]
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.watermark >= self.size
    }

    /// Commit `bytes` aligned to `align`, advancing the watermark.
    ///
    /// Returns the physical address of the committed range.
    pub fn commit(&mut self, bytes: u64, align: u64) -> Result<PhysAddr, CapError> {
        debug_assert!(align.is_power_of_two());
        let aligned = (self.watermark + align - 1) & !(align - 1);
        let end = aligned.checked_add(bytes).ok_or(CapError::UntypedExhausted)?;
        if end > self.size {
            return Err(CapError::UntypedExhausted);
        }
        self.watermark = end;
        self.live_bytes += bytes;
        Ok(self.base.offset(aligned))
    }

    /// Record that a child of `bytes` committed bytes was destroyed.
    ///
    /// When the last child goes away the watermark resets, making the
    /// region whole again.
    pub fn release(&mut self, bytes: u64) {
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
        if self.live_bytes == 0 {
            self.watermark = 0;
        }
    }
}

impl fmt::Display for UntypedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "untyped {} +{:#x}/{:#x}",
            self.base, self.watermark, self.size
        )
    }
}

/// Size in bytes of a kernel object of the given type.
///
/// These are the units retype commits from an untyped region. CNodes are
/// the full fixed-radix slot array; Thread covers the TCB record;
/// page-granular objects are one frame.
pub const fn object_size(ty: ObjectType) -> Result<u64, CapError> {
    match ty {
        ObjectType::CNode => Ok((CNODE_SLOTS * 32) as u64),
        ObjectType::Endpoint => Ok(64),
        ObjectType::Thread => Ok(1024),
        ObjectType::AddressSpace | ObjectType::Frame | ObjectType::PageTable => Ok(4096),
        ObjectType::Null | ObjectType::Untyped | ObjectType::IrqHandler => {
            Err(CapError::InvalidOperation)
        }
    }
}

/// Alignment requirement for a kernel object of the given type.
pub const fn object_alignment(ty: ObjectType) -> u64 {
    match ty {
        ObjectType::AddressSpace | ObjectType::Frame | ObjectType::PageTable => 4096,
        ObjectType::CNode => 4096,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_advances_watermark() {
        let mut ut = UntypedObject::new(PhysAddr::new(0x10_0000), 0x1_0000);
        let a = ut.commit(64, 64).unwrap();
        assert_eq!(a.as_u64(), 0x10_0000);
        assert_eq!(ut.watermark, 64);

        let b = ut.commit(4096, 4096).unwrap();
        assert_eq!(b.as_u64(), 0x10_1000);
        assert_eq!(ut.watermark, 0x2000);
    }

    #[test]
    fn test_commit_exhaustion() {
        let mut ut = UntypedObject::new(PhysAddr::new(0x1000), 128);
        ut.commit(128, 64).unwrap();
        assert!(ut.is_exhausted());
        assert_eq!(ut.commit(1, 1), Err(CapError::UntypedExhausted));
    }

    #[test]
    fn test_no_partial_commit_on_failure() {
        let mut ut = UntypedObject::new(PhysAddr::new(0x1000), 4096);
        ut.commit(64, 64).unwrap();
        let before = ut.watermark;
        assert!(ut.commit(8192, 64).is_err());
        assert_eq!(ut.watermark, before);
    }

    #[test]
    fn test_object_sizes() {
        assert_eq!(object_size(ObjectType::CNode).unwrap(), 131072);
        assert_eq!(object_size(ObjectType::Frame).unwrap(), 4096);
        assert_eq!(object_size(ObjectType::Endpoint).unwrap(), 64);
        assert!(object_size(ObjectType::Untyped).is_err());
        assert!(object_size(ObjectType::IrqHandler).is_err());
    }
}
