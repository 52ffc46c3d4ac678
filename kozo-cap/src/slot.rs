//! Capability slot storage
//!
//! A capability slot is the fundamental unit of capability storage. Each
//! slot holds exactly one capability or is empty. Slots are organised into
//! CNodes, which form the capability space of a thread.
//!
//! # Layout
//!
//! [`CapSlot`] packs into exactly 32 bytes, two per cache line: the
//! per-type datum, the badge, the three derivation links, and the type and
//! rights tags.
//!
//! # Derivation links
//!
//! The derivation tree is threaded through the slots themselves as
//! [`SlotRef`] indices (parent, first child, next sibling). Index-based
//! links keep revocation an iterative walk over plain values: clearing a
//! slot invalidates every reference to it, and no pointer aliasing is
//! involved.

use core::fmt;

use kozo_common::PhysAddr;

use crate::cnode::CNodeId;
use crate::{Badge, CapRights};

/// Object type discriminant, stored as a single byte in the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ObjectType {
    /// Empty slot (no capability).
    #[default]
    Null = 0,
    /// Untyped memory: raw physical bytes awaiting retype.
    Untyped = 1,
    /// Capability node (slot table).
    CNode = 2,
    /// Synchronous IPC endpoint.
    Endpoint = 3,
    /// Thread control block.
    Thread = 4,
    /// Address space root (top-level page table).
    AddressSpace = 5,
    /// Mappable memory frame.
    Frame = 6,
    /// Intermediate page table.
    PageTable = 7,
    /// Interrupt line handler.
    IrqHandler = 8,
}

impl ObjectType {
    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Untyped => "Untyped",
            Self::CNode => "CNode",
            Self::Endpoint => "Endpoint",
            Self::Thread => "Thread",
            Self::AddressSpace => "AddressSpace",
            Self::Frame => "Frame",
            Self::PageTable => "PageTable",
            Self::IrqHandler => "IrqHandler",
        }
    }

    /// Check if this type carries a meaningful badge on invocation.
    #[inline]
    #[must_use]
    pub const fn supports_badge(self) -> bool {
        matches!(self, Self::Endpoint)
    }

    /// Check if this slot type is empty.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if the per-type datum is a physical address.
    ///
    /// For these types the slot datum is the object's physical base; for
    /// everything else it is an index into a kernel object table.
    #[inline]
    #[must_use]
    pub const fn data_is_phys(self) -> bool {
        matches!(self, Self::AddressSpace | Self::Frame | Self::PageTable)
    }

    /// Check if objects of this type can be created by retype.
    #[inline]
    #[must_use]
    pub const fn is_retype_target(self) -> bool {
        matches!(
            self,
            Self::CNode
                | Self::Endpoint
                | Self::Thread
                | Self::AddressSpace
                | Self::Frame
                | Self::PageTable
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Index-based slot address: a CNode identifier plus a slot index.
///
/// Packed into 32 bits (`cnode << 16 | index`). `SlotRef::NULL` is the
/// all-ones pattern and never addresses a real slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SlotRef(u32);

impl SlotRef {
    /// The null reference.
    pub const NULL: Self = Self(u32::MAX);

    /// Create a reference to `index` within `cnode`.
    #[inline]
    #[must_use]
    pub const fn new(cnode: CNodeId, index: u16) -> Self {
        Self(((cnode.value() as u32) << 16) | index as u32)
    }

    /// The CNode component.
    #[inline]
    #[must_use]
    pub const fn cnode(self) -> CNodeId {
        CNodeId::new((self.0 >> 16) as u16)
    }

    /// The slot-index component.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u16 {
        self.0 as u16
    }

    /// The packed representation (badge-mixing input).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is the null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid (non-null) reference.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for SlotRef {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "SlotRef::NULL")
        } else {
            write!(f, "SlotRef({}:{})", self.cnode().value(), self.index())
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}:{}", self.cnode().value(), self.index())
        }
    }
}

/// Slot bookkeeping flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SlotFlags(u8);

impl SlotFlags {
    /// No flags.
    pub const NONE: Self = Self(0);

    /// This capability is the original handle on its object (created by
    /// retype or boot seeding, not by mint or copy). Revocation tears
    /// the object itself down only through an original.
    pub const ORIGINAL: Self = Self(1 << 0);

    /// Check if a flag is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Capability slot.
///
/// # Layout
///
/// | Offset | Size | Field        |
/// |--------|------|--------------|
/// | 0      | 8    | data         |
/// | 8      | 8    | badge        |
/// | 16     | 4    | parent       |
/// | 20     | 4    | first_child  |
/// | 24     | 4    | next_sibling |
/// | 28     | 1    | cap_type     |
/// | 29     | 1    | rights       |
/// | 30     | 1    | flags        |
/// | 31     | 1    | (padding)    |
///
/// # Invariants
///
/// - A `Null` slot has every other field zeroed/null
/// - `badge` is meaningful only when `cap_type.supports_badge()`
/// - A child's rights are a subset of its parent's
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CapSlot {
    /// Per-type datum: a physical address for memory objects, an object
    /// table index otherwise.
    data: u64,
    /// Badge assigned at creation.
    badge: Badge,
    /// Capability this one was derived from.
    pub(crate) parent: SlotRef,
    /// First capability derived from this one.
    pub(crate) first_child: SlotRef,
    /// Next capability with the same parent.
    pub(crate) next_sibling: SlotRef,
    /// Object type tag.
    cap_type: ObjectType,
    /// Access rights.
    rights: CapRights,
    /// Bookkeeping flags.
    flags: SlotFlags,
    _pad: [u8; 1],
}

const _: () = assert!(core::mem::size_of::<CapSlot>() == 32);

impl CapSlot {
    /// Create an empty slot.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self {
            data: 0,
            badge: Badge::NONE,
            parent: SlotRef::NULL,
            first_child: SlotRef::NULL,
            next_sibling: SlotRef::NULL,
            cap_type: ObjectType::Null,
            rights: CapRights::NONE,
            flags: SlotFlags::NONE,
            _pad: [0; 1],
        }
    }

    /// Create an occupied slot with no derivation links yet.
    #[inline]
    #[must_use]
    pub const fn new(cap_type: ObjectType, rights: CapRights, badge: Badge, data: u64) -> Self {
        Self {
            data,
            badge,
            parent: SlotRef::NULL,
            first_child: SlotRef::NULL,
            next_sibling: SlotRef::NULL,
            cap_type,
            rights,
            flags: SlotFlags::NONE,
            _pad: [0; 1],
        }
    }

    /// Check if the slot is empty.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.cap_type.is_null()
    }

    /// Object type tag.
    #[inline]
    #[must_use]
    pub const fn cap_type(&self) -> ObjectType {
        self.cap_type
    }

    /// Access rights.
    #[inline]
    #[must_use]
    pub const fn rights(&self) -> CapRights {
        self.rights
    }

    /// Attenuate rights in place. The new set must already be a subset.
    #[inline]
    pub(crate) fn set_rights(&mut self, rights: CapRights) {
        self.rights = rights;
    }

    /// Badge.
    #[inline]
    #[must_use]
    pub const fn badge(&self) -> Badge {
        self.badge
    }

    #[inline]
    pub(crate) fn set_badge(&mut self, badge: Badge) {
        self.badge = badge;
    }

    /// Raw per-type datum.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> u64 {
        self.data
    }

    /// Datum as a physical address (memory objects).
    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysAddr {
        PhysAddr::new(self.data)
    }

    /// Datum as an object-table index.
    #[inline]
    #[must_use]
    pub const fn object_index(&self) -> usize {
        self.data as usize
    }

    /// Derivation parent.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> SlotRef {
        self.parent
    }

    /// First derived child.
    #[inline]
    #[must_use]
    pub const fn first_child(&self) -> SlotRef {
        self.first_child
    }

    /// Next sibling in the parent's child list.
    #[inline]
    #[must_use]
    pub const fn next_sibling(&self) -> SlotRef {
        self.next_sibling
    }

    /// Check if this capability carries the given rights.
    #[inline]
    #[must_use]
    pub const fn has_rights(&self, required: CapRights) -> bool {
        self.rights.contains(required)
    }

    /// Check if this is the original capability on its object.
    #[inline]
    #[must_use]
    pub const fn is_original(&self) -> bool {
        self.flags.contains(SlotFlags::ORIGINAL)
    }

    /// Mark this capability as the original handle on its object.
    #[inline]
    pub fn mark_original(&mut self) {
        self.flags = SlotFlags(self.flags.0 | SlotFlags::ORIGINAL.0);
    }

    /// Clear the slot back to `Null`.
    #[inline]
    pub fn clear(&mut self) {
        *self = Self::null();
    }
}

impl Default for CapSlot {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for CapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "<empty>")
        } else {
            write!(f, "{} [{}]", self.cap_type, self.rights)?;
            if !self.badge.is_none() {
                write!(f, " badge={}", self.badge)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_size() {
        assert_eq!(core::mem::size_of::<CapSlot>(), 32);
    }

    #[test]
    fn test_null_slot() {
        let slot = CapSlot::null();
        assert!(slot.is_null());
        assert!(slot.parent().is_null());
        assert!(slot.first_child().is_null());
        assert_eq!(slot.cap_type(), ObjectType::Null);
    }

    #[test]
    fn test_slot_ref_packing() {
        let r = SlotRef::new(CNodeId::new(5), 4095);
        assert_eq!(r.cnode().value(), 5);
        assert_eq!(r.index(), 4095);
        assert!(r.is_valid());
        assert!(SlotRef::NULL.is_null());
    }

    #[test]
    fn test_badge_support() {
        assert!(ObjectType::Endpoint.supports_badge());
        assert!(!ObjectType::Frame.supports_badge());
        assert!(!ObjectType::Thread.supports_badge());
    }

    #[test]
    fn test_retype_targets() {
        assert!(ObjectType::CNode.is_retype_target());
        assert!(ObjectType::Endpoint.is_retype_target());
        assert!(!ObjectType::Untyped.is_retype_target());
        assert!(!ObjectType::IrqHandler.is_retype_target());
        assert!(!ObjectType::Null.is_retype_target());
    }
}
