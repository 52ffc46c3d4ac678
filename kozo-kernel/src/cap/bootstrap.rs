//! Boot-time capability seeding
//!
//! Builds the first capability space: a 16 MiB Untyped donation carved
//! from conventional memory, the root CNode (whose own storage is the
//! first commitment from that donation), and the well-known slots the
//! first service finds on startup.
//!
//! # Root CNode layout
//!
//! | Slot | Capability |
//! |---|---|
//! | 0 | Untyped over the initial donation (derivation root) |
//! | 1 | The root CNode itself |
//! | 2 | The first service's Thread |
//! | 3 | The first service's AddressSpace |
//!
//! Slots 4 and up are free for the service to populate.

use kozo_cap::{ops, CNodeId, CapRights, CapSlot, ObjectType, SlotRef, UntypedObject, CNODE_SLOTS};
use kozo_syscall::INITIAL_UNTYPED_BYTES;

use crate::memory::frame;

use super::space::{with_space, PhysZero};

/// Slot of the initial Untyped capability.
pub const ROOT_UNTYPED_SLOT: u16 = 0;

/// Slot of the root CNode's self-capability.
pub const ROOT_CNODE_SLOT: u16 = 1;

/// Slot of the first service's Thread capability.
pub const INIT_THREAD_SLOT: u16 = 2;

/// Slot of the first service's AddressSpace capability.
pub const INIT_ASPACE_SLOT: u16 = 3;

/// First slot left free for the service.
pub const FIRST_FREE_SLOT: u16 = 4;

/// Handles produced by [`init`].
#[derive(Debug, Clone, Copy)]
pub struct BootCaps {
    /// The root CNode every boot capability lives in.
    pub root_cnode: CNodeId,
    /// Untyped-registry index of the initial donation.
    pub untyped_index: usize,
}

/// Seed the initial capability space. Call once, after the frame
/// allocator is up.
///
/// # Panics
///
/// Panics if no contiguous conventional region can hold the donation —
/// the system cannot host services without it.
pub fn init() -> BootCaps {
    let donation = frame::reserve_contiguous(INITIAL_UNTYPED_BYTES)
        .expect("no contiguous region for the initial untyped donation");

    with_space(|space| {
        let untyped_index = space
            .untypeds
            .register(UntypedObject::new(donation, INITIAL_UNTYPED_BYTES))
            .expect("untyped registry full at boot");

        // The root CNode's storage is the donation's first commitment.
        let cnode_bytes = (CNODE_SLOTS * core::mem::size_of::<CapSlot>()) as u64;
        let cnode_phys = space
            .untypeds
            .get_mut(untyped_index)
            .expect("donation vanished")
            .commit(cnode_bytes, 4096)
            .expect("donation cannot hold the root CNode");
        kozo_cap::ObjectMemory::zero(&mut PhysZero, cnode_phys, cnode_bytes);

        let root_cnode = space
            .cnodes
            .register(cnode_phys)
            .expect("CNode registry full at boot");

        let untyped_slot = SlotRef::new(root_cnode, ROOT_UNTYPED_SLOT);
        ops::install_root(
            &mut space.cnodes,
            untyped_slot,
            ObjectType::Untyped,
            CapRights::ALL,
            untyped_index as u64,
            &mut space.minter,
        )
        .expect("seeding the untyped capability");

        // The CNode came out of the donation, so it hangs off slot 0.
        ops::install_child(
            &mut space.cnodes,
            untyped_slot,
            SlotRef::new(root_cnode, ROOT_CNODE_SLOT),
            ObjectType::CNode,
            CapRights::ALL,
            root_cnode.value() as u64,
            &mut space.minter,
        )
        .expect("seeding the root CNode capability");

        log::info!(
            "capability space seeded: donation {} ({} MiB), root CNode {}",
            donation,
            INITIAL_UNTYPED_BYTES / (1024 * 1024),
            root_cnode,
        );

        BootCaps {
            root_cnode,
            untyped_index,
        }
    })
}
