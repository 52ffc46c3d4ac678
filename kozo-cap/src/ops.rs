//! Capability operations
//!
//! Retype, mint, transfer, delete, revoke, and verify, generic over the
//! storage the kernel provides. The operations maintain the derivation
//! tree threaded through the slots and never leave a half-modified tree
//! behind: every failure path returns before the first mutation or rolls
//! the mutation back.
//!
//! # Storage seam
//!
//! [`CapStore`] resolves [`SlotRef`]s to slots; the kernel implements it
//! over CNode frames, tests over arrays. [`ObjectMemory`] zeroes committed
//! physical bytes during retype. [`ResourceReclaim`] is invoked for every
//! slot destroyed by revocation, after its children are gone, so the
//! kernel can free frames, wake queued threads, and recycle TCBs.

use kozo_common::PhysAddr;

use crate::badge::{Badge, BadgeMinter};
use crate::cnode::CNodeId;
use crate::error::{CapError, CapResult};
use crate::rights::CapRights;
use crate::slot::{CapSlot, ObjectType, SlotRef};
use crate::untyped::{object_alignment, object_size, UntypedObject};

/// Upper bound on derivation depth during revocation descent.
const MAX_DERIVATION_DEPTH: usize = 128;

/// Upper bound on slots destroyed by a single revocation.
const MAX_REVOKE_STEPS: usize = 1 << 20;

/// Slot storage interface implemented by the kernel (and by tests).
pub trait CapStore {
    /// Resolve a slot reference, if it addresses existing storage.
    fn slot(&self, r: SlotRef) -> Option<&CapSlot>;

    /// Resolve a slot reference mutably.
    fn slot_mut(&mut self, r: SlotRef) -> Option<&mut CapSlot>;

    /// First occupied slot within `cnode`, excluding `except`.
    ///
    /// Used by revocation to empty a CNode before destroying the
    /// capability to it. `except` breaks the cycle when a CNode holds a
    /// capability to itself.
    fn first_occupied(&self, cnode: CNodeId, except: SlotRef) -> Option<SlotRef>;
}

/// Physical-memory writer used by retype to zero committed bytes.
pub trait ObjectMemory {
    /// Zero `len` bytes of physical memory starting at `base`.
    fn zero(&mut self, base: PhysAddr, len: u64);
}

/// Teardown hook invoked for every slot destroyed by revocation.
pub trait ResourceReclaim {
    /// Release the resources behind a capability.
    ///
    /// Called after all of the capability's descendants are destroyed,
    /// with the slot's final contents. Typical kernel actions: return a
    /// frame to the allocator, wake an endpoint's queued threads with an
    /// error, remove a thread from the scheduler.
    fn release(&mut self, at: SlotRef, slot: &CapSlot);
}

/// Read a slot by value (slots are 32-byte `Copy` records).
#[inline]
fn get<S: CapStore>(store: &S, r: SlotRef) -> CapResult<CapSlot> {
    store.slot(r).copied().ok_or(CapError::InvalidIndex)
}

/// Link `child` as a derivation child of `parent`.
///
/// The child is pushed on the front of the parent's child list.
fn link_child<S: CapStore>(store: &mut S, parent: SlotRef, child: SlotRef) -> CapResult<()> {
    let old_first = get(store, parent)?.first_child();
    {
        let c = store.slot_mut(child).ok_or(CapError::InvalidIndex)?;
        c.parent = parent;
        c.next_sibling = old_first;
    }
    let p = store.slot_mut(parent).ok_or(CapError::InvalidIndex)?;
    p.first_child = child;
    Ok(())
}

/// Remove `r` from its parent's child list. Roots are untouched.
fn unlink<S: CapStore>(store: &mut S, r: SlotRef) -> CapResult<()> {
    let node = get(store, r)?;
    let parent = node.parent();
    if parent.is_null() {
        return Ok(());
    }

    let first = get(store, parent)?.first_child();
    if first == r {
        let p = store.slot_mut(parent).ok_or(CapError::InvalidIndex)?;
        p.first_child = node.next_sibling();
    } else {
        // Walk the sibling list to the predecessor.
        let mut pred = first;
        let mut steps = 0;
        loop {
            let pred_slot = get(store, pred)?;
            if pred_slot.next_sibling() == r {
                let p = store.slot_mut(pred).ok_or(CapError::InvalidIndex)?;
                p.next_sibling = node.next_sibling();
                break;
            }
            pred = pred_slot.next_sibling();
            if pred.is_null() {
                // Not in the list; links already consistent.
                break;
            }
            steps += 1;
            if steps > MAX_REVOKE_STEPS {
                return Err(CapError::TraversalLimit);
            }
        }
    }

    let n = store.slot_mut(r).ok_or(CapError::InvalidIndex)?;
    n.parent = SlotRef::NULL;
    n.next_sibling = SlotRef::NULL;
    Ok(())
}

/// Install a derivation-root capability into an empty slot.
///
/// Used when seeding the initial capabilities at boot; roots have no
/// parent and anchor the derivation forest.
pub fn install_root<S: CapStore>(
    store: &mut S,
    dst: SlotRef,
    ty: ObjectType,
    rights: CapRights,
    data: u64,
    minter: &mut BadgeMinter,
) -> CapResult<Badge> {
    if !get(store, dst)?.is_null() {
        return Err(CapError::SlotOccupied);
    }
    let badge = minter.next(dst, ty);
    let slot = store.slot_mut(dst).ok_or(CapError::InvalidIndex)?;
    *slot = CapSlot::new(ty, rights, badge, data);
    slot.mark_original();
    Ok(badge)
}

/// Install a capability into an empty slot as a derivation child of
/// `parent`, with rights no wider than the parent's.
pub fn install_child<S: CapStore>(
    store: &mut S,
    parent: SlotRef,
    dst: SlotRef,
    ty: ObjectType,
    rights: CapRights,
    data: u64,
    minter: &mut BadgeMinter,
) -> CapResult<Badge> {
    if parent == dst {
        return Err(CapError::InvalidOperation);
    }
    let parent_slot = get(store, parent)?;
    if parent_slot.is_null() {
        return Err(CapError::EmptySlot);
    }
    if !rights.is_subset_of(parent_slot.rights()) {
        return Err(CapError::RightsEscalation);
    }
    if !get(store, dst)?.is_null() {
        return Err(CapError::SlotOccupied);
    }
    let badge = minter.next(dst, ty);
    let slot = store.slot_mut(dst).ok_or(CapError::InvalidIndex)?;
    *slot = CapSlot::new(ty, rights, badge, data);
    slot.mark_original();
    link_child(store, parent, dst)?;
    Ok(badge)
}

/// Retype a prefix of an Untyped region into `count` new objects.
///
/// Commits `count * object_size(target)` bytes (aligned up) from `ut`,
/// zeroes them, and installs `count` capabilities at consecutive slots
/// starting at `dest`, each a derivation child of `src` with the source's
/// rights and a fresh badge.
///
/// `make_data` supplies the per-type slot datum for each new object (an
/// object-table index or the committed physical address); it may fail, in
/// which case the whole retype unwinds and no slot is installed.
#[allow(clippy::too_many_arguments)]
pub fn retype<S, M, F>(
    store: &mut S,
    mem: &mut M,
    ut: &mut UntypedObject,
    src: SlotRef,
    target: ObjectType,
    dest: SlotRef,
    count: usize,
    minter: &mut BadgeMinter,
    mut make_data: F,
) -> CapResult<()>
where
    S: CapStore,
    M: ObjectMemory,
    F: FnMut(usize, PhysAddr) -> CapResult<u64>,
{
    if count == 0 {
        return Err(CapError::InvalidOperation);
    }
    if !target.is_retype_target() {
        return Err(CapError::InvalidOperation);
    }

    let src_slot = get(store, src)?;
    if src_slot.is_null() {
        return Err(CapError::EmptySlot);
    }
    if src_slot.cap_type() != ObjectType::Untyped {
        return Err(CapError::TypeMismatch);
    }

    // All destination slots must exist, be empty, and not alias the source.
    let dest_cnode = dest.cnode();
    let base_index = dest.index() as usize;
    for i in 0..count {
        let r = SlotRef::new(dest_cnode, (base_index + i) as u16);
        if r == src {
            return Err(CapError::InvalidOperation);
        }
        if !get(store, r)?.is_null() {
            return Err(CapError::SlotOccupied);
        }
    }

    let size = object_size(target)?;
    let align = object_alignment(target);
    let total = size
        .checked_mul(count as u64)
        .ok_or(CapError::UntypedExhausted)?;

    // Snapshot for unwinding if object construction fails partway.
    let saved_watermark = ut.watermark;
    let saved_live = ut.live_bytes;

    let base = ut.commit(total, align)?;
    mem.zero(base, total);

    for i in 0..count {
        let r = SlotRef::new(dest_cnode, (base_index + i) as u16);
        let phys = base.offset(i as u64 * size);
        let data = match make_data(i, phys) {
            Ok(d) => d,
            Err(e) => {
                // Unwind: clear what we installed, restore the watermark.
                for j in 0..i {
                    let rj = SlotRef::new(dest_cnode, (base_index + j) as u16);
                    let _ = unlink(store, rj);
                    if let Some(s) = store.slot_mut(rj) {
                        s.clear();
                    }
                }
                ut.watermark = saved_watermark;
                ut.live_bytes = saved_live;
                return Err(e);
            }
        };

        let badge = minter.next(r, target);
        let slot = store.slot_mut(r).ok_or(CapError::InvalidIndex)?;
        *slot = CapSlot::new(target, src_slot.rights(), badge, data);
        slot.mark_original();
        link_child(store, src, r)?;
    }

    Ok(())
}

/// Mint an attenuated child capability.
///
/// The child's rights are `parent & mask`; its badge is freshly
/// generated, observably distinct from the parent's. Returns the new
/// badge.
pub fn mint<S: CapStore>(
    store: &mut S,
    src: SlotRef,
    dst: SlotRef,
    mask: CapRights,
    minter: &mut BadgeMinter,
) -> CapResult<Badge> {
    if src == dst {
        return Err(CapError::InvalidOperation);
    }
    let src_slot = get(store, src)?;
    if src_slot.is_null() {
        return Err(CapError::EmptySlot);
    }
    if !get(store, dst)?.is_null() {
        return Err(CapError::SlotOccupied);
    }

    let rights = src_slot.rights().intersect(mask);
    let badge = minter.next(dst, src_slot.cap_type());

    let slot = store.slot_mut(dst).ok_or(CapError::InvalidIndex)?;
    *slot = CapSlot::new(src_slot.cap_type(), rights, badge, src_slot.data());
    link_child(store, src, dst)?;
    Ok(badge)
}

/// Transfer a capability between slots.
///
/// A copy installs an identical capability (same rights, same badge) as a
/// derivation child of the source, so revoking the source reaches every
/// copy. A move relocates the slot wholesale: the source becomes Null and
/// the derivation links — parent, children, and position among siblings —
/// follow the capability to its new home.
pub fn transfer<S: CapStore>(store: &mut S, src: SlotRef, dst: SlotRef, mv: bool) -> CapResult<()> {
    if src == dst {
        return Err(CapError::InvalidOperation);
    }
    let src_slot = get(store, src)?;
    if src_slot.is_null() {
        return Err(CapError::EmptySlot);
    }
    if !get(store, dst)?.is_null() {
        return Err(CapError::SlotOccupied);
    }

    if !mv {
        let slot = store.slot_mut(dst).ok_or(CapError::InvalidIndex)?;
        *slot = CapSlot::new(
            src_slot.cap_type(),
            src_slot.rights(),
            src_slot.badge(),
            src_slot.data(),
        );
        return link_child(store, src, dst);
    }

    // Move: splice dst into the tree exactly where src was.
    let parent = src_slot.parent();
    if parent.is_valid() {
        let first = get(store, parent)?.first_child();
        if first == src {
            let p = store.slot_mut(parent).ok_or(CapError::InvalidIndex)?;
            p.first_child = dst;
        } else {
            let mut pred = first;
            let mut steps = 0;
            while pred.is_valid() {
                let pred_slot = get(store, pred)?;
                if pred_slot.next_sibling() == src {
                    let p = store.slot_mut(pred).ok_or(CapError::InvalidIndex)?;
                    p.next_sibling = dst;
                    break;
                }
                pred = pred_slot.next_sibling();
                steps += 1;
                if steps > MAX_REVOKE_STEPS {
                    return Err(CapError::TraversalLimit);
                }
            }
        }
    }

    // Children now hang off the destination.
    let mut child = src_slot.first_child();
    let mut steps = 0;
    while child.is_valid() {
        let next = {
            let c = store.slot_mut(child).ok_or(CapError::InvalidIndex)?;
            c.parent = dst;
            c.next_sibling()
        };
        child = next;
        steps += 1;
        if steps > MAX_REVOKE_STEPS {
            return Err(CapError::TraversalLimit);
        }
    }

    let slot = store.slot_mut(dst).ok_or(CapError::InvalidIndex)?;
    *slot = src_slot;
    let s = store.slot_mut(src).ok_or(CapError::InvalidIndex)?;
    s.clear();
    Ok(())
}

/// Remove a capability from its slot without destroying its subtree.
///
/// The slot's children are reparented to its own parent (or become
/// derivation roots). Used when a subtree is being restructured rather
/// than torn down.
pub fn delete<S: CapStore>(store: &mut S, r: SlotRef) -> CapResult<()> {
    let node = get(store, r)?;
    if node.is_null() {
        return Err(CapError::EmptySlot);
    }

    unlink(store, r)?;

    // Hand each child to the grandparent.
    let parent = node.parent();
    let mut child = node.first_child();
    let mut steps = 0;
    while child.is_valid() {
        let next = {
            let c = store.slot_mut(child).ok_or(CapError::InvalidIndex)?;
            let next = c.next_sibling();
            c.parent = SlotRef::NULL;
            c.next_sibling = SlotRef::NULL;
            next
        };
        if parent.is_valid() {
            link_child(store, parent, child)?;
        }
        child = next;
        steps += 1;
        if steps > MAX_REVOKE_STEPS {
            return Err(CapError::TraversalLimit);
        }
    }

    let s = store.slot_mut(r).ok_or(CapError::InvalidIndex)?;
    s.clear();
    Ok(())
}

/// Check a capability's badge in constant time.
pub fn verify<S: CapStore>(store: &S, r: SlotRef, expected: Badge) -> CapResult<bool> {
    let slot = get(store, r)?;
    if slot.is_null() {
        return Err(CapError::EmptySlot);
    }
    Ok(slot.badge().ct_eq(expected))
}

/// Revoke a capability: destroy its entire derivation subtree, children
/// first, then the capability itself.
///
/// The traversal is iterative: each round descends to a leaf-most
/// descendant and destroys it. A capability to a CNode is only destroyed
/// once every slot inside that CNode has been revoked, so no capability
/// survives inside a container that is going away. A CNode holding a
/// capability to itself is treated as a leaf once it is otherwise empty.
///
/// Returns the number of capabilities destroyed.
pub fn revoke<S: CapStore, R: ResourceReclaim>(
    store: &mut S,
    root: SlotRef,
    reclaim: &mut R,
) -> CapResult<usize> {
    if get(store, root)?.is_null() {
        return Err(CapError::EmptySlot);
    }

    let mut destroyed = 0;
    loop {
        // Descend to a victim with no remaining dependents.
        let mut cur = root;
        let mut depth = 0;
        loop {
            let slot = get(store, cur)?;
            if slot.first_child().is_valid() {
                cur = slot.first_child();
            } else if slot.cap_type() == ObjectType::CNode {
                let inner = CNodeId::new(slot.data() as u16);
                match store.first_occupied(inner, cur) {
                    Some(next) if next != cur => cur = next,
                    _ => break,
                }
            } else {
                break;
            }
            depth += 1;
            if depth > MAX_DERIVATION_DEPTH {
                return Err(CapError::TraversalLimit);
            }
        }

        let victim = get(store, cur)?;
        unlink(store, cur)?;
        let s = store.slot_mut(cur).ok_or(CapError::InvalidIndex)?;
        s.clear();
        reclaim.release(cur, &victim);

        destroyed += 1;
        if cur == root {
            return Ok(destroyed);
        }
        if destroyed > MAX_REVOKE_STEPS {
            return Err(CapError::TraversalLimit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    const SLOTS: usize = 64;
    const CNODES: usize = 4;

    /// In-memory store: four CNodes of 64 slots each.
    struct TestStore {
        cnodes: [[CapSlot; SLOTS]; CNODES],
    }

    impl TestStore {
        fn new() -> Self {
            Self {
                cnodes: [[CapSlot::null(); SLOTS]; CNODES],
            }
        }
    }

    impl CapStore for TestStore {
        fn slot(&self, r: SlotRef) -> Option<&CapSlot> {
            if r.is_null() {
                return None;
            }
            self.cnodes
                .get(r.cnode().value() as usize)?
                .get(r.index() as usize)
        }

        fn slot_mut(&mut self, r: SlotRef) -> Option<&mut CapSlot> {
            if r.is_null() {
                return None;
            }
            self.cnodes
                .get_mut(r.cnode().value() as usize)?
                .get_mut(r.index() as usize)
        }

        fn first_occupied(&self, cnode: CNodeId, except: SlotRef) -> Option<SlotRef> {
            let table = self.cnodes.get(cnode.value() as usize)?;
            for (i, slot) in table.iter().enumerate() {
                let r = SlotRef::new(cnode, i as u16);
                if !slot.is_null() && r != except {
                    return Some(r);
                }
            }
            None
        }
    }

    struct NullMemory;

    impl ObjectMemory for NullMemory {
        fn zero(&mut self, _base: PhysAddr, _len: u64) {}
    }

    #[derive(Default)]
    struct RecordingReclaim {
        released: Vec<(SlotRef, ObjectType, u64)>,
    }

    impl ResourceReclaim for RecordingReclaim {
        fn release(&mut self, at: SlotRef, slot: &CapSlot) {
            self.released.push((at, slot.cap_type(), slot.data()));
        }
    }

    const CN0: CNodeId = CNodeId::new(0);
    const CN1: CNodeId = CNodeId::new(1);

    fn slot0() -> SlotRef {
        SlotRef::new(CN0, 0)
    }

    /// Seed an untyped capability at cn0 slot 0 over 16 MiB.
    fn seed_untyped(store: &mut TestStore) -> UntypedObject {
        let s = store.slot_mut(slot0()).unwrap();
        *s = CapSlot::new(ObjectType::Untyped, CapRights::ALL, Badge::new(1), 0);
        UntypedObject::new(PhysAddr::new(0x100_0000), 16 * 1024 * 1024)
    }

    fn phys_data(_i: usize, phys: PhysAddr) -> CapResult<u64> {
        Ok(phys.as_u64())
    }

    #[test]
    fn test_retype_installs_child() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        let dest = SlotRef::new(CN0, 1);

        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::CNode,
            dest,
            1,
            &mut minter,
            |_, _| Ok(1),
        )
        .unwrap();

        let child = *store.slot(dest).unwrap();
        assert_eq!(child.cap_type(), ObjectType::CNode);
        assert_eq!(child.parent(), slot0());
        assert_eq!(child.rights(), CapRights::ALL);
        assert_eq!(store.slot(slot0()).unwrap().first_child(), dest);
        // Watermark advanced by the aligned CNode size.
        assert_eq!(ut.watermark, 4096 * 32);
    }

    #[test]
    fn test_retype_occupied_dest_rejected() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        let dest = SlotRef::new(CN0, 1);
        *store.slot_mut(dest).unwrap() =
            CapSlot::new(ObjectType::Frame, CapRights::RW, Badge::new(9), 0x1000);

        let before = ut.watermark;
        let r = retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            dest,
            1,
            &mut minter,
            phys_data,
        );
        assert_eq!(r, Err(CapError::SlotOccupied));
        assert_eq!(ut.watermark, before);
    }

    #[test]
    fn test_retype_exhaustion_is_clean() {
        let mut store = TestStore::new();
        let mut ut = UntypedObject::new(PhysAddr::new(0x1000), 128);
        *store.slot_mut(slot0()).unwrap() =
            CapSlot::new(ObjectType::Untyped, CapRights::ALL, Badge::new(1), 0);
        let mut minter = BadgeMinter::new();

        let r = retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Frame,
            SlotRef::new(CN0, 1),
            1,
            &mut minter,
            phys_data,
        );
        assert_eq!(r, Err(CapError::UntypedExhausted));
        assert!(store.slot(SlotRef::new(CN0, 1)).unwrap().is_null());
        assert_eq!(ut.watermark, 0);
    }

    #[test]
    fn test_retype_unwinds_on_construction_failure() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();

        let r = retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            SlotRef::new(CN0, 1),
            3,
            &mut minter,
            |i, _| {
                if i == 2 {
                    Err(CapError::OutOfMemory)
                } else {
                    Ok(i as u64)
                }
            },
        );
        assert_eq!(r, Err(CapError::OutOfMemory));
        for i in 1..=3 {
            assert!(store.slot(SlotRef::new(CN0, i)).unwrap().is_null());
        }
        assert_eq!(ut.watermark, 0);
        assert!(store.slot(slot0()).unwrap().first_child().is_null());
    }

    #[test]
    fn test_mint_attenuates_and_rebadges() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        let ep = SlotRef::new(CN0, 1);
        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            ep,
            1,
            &mut minter,
            |_, _| Ok(7),
        )
        .unwrap();

        let dst = SlotRef::new(CN0, 2);
        let badge = mint(&mut store, ep, dst, CapRights::READ, &mut minter).unwrap();

        let child = *store.slot(dst).unwrap();
        assert_eq!(child.rights(), CapRights::READ);
        assert_eq!(child.parent(), ep);
        assert_eq!(child.badge(), badge);
        assert_ne!(child.badge(), store.slot(ep).unwrap().badge());
        // Rights monotonicity: child ⊆ parent.
        assert!(child.rights().is_subset_of(store.slot(ep).unwrap().rights()));
    }

    #[test]
    fn test_mint_cannot_widen() {
        let mut store = TestStore::new();
        let mut minter = BadgeMinter::new();
        let src = SlotRef::new(CN0, 1);
        *store.slot_mut(src).unwrap() =
            CapSlot::new(ObjectType::Endpoint, CapRights::READ, Badge::new(3), 7);

        let dst = SlotRef::new(CN0, 2);
        mint(&mut store, src, dst, CapRights::ALL, &mut minter).unwrap();
        assert_eq!(store.slot(dst).unwrap().rights(), CapRights::READ);
    }

    #[test]
    fn test_revoke_closure() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        let ep = SlotRef::new(CN0, 1);
        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            ep,
            1,
            &mut minter,
            |_, _| Ok(7),
        )
        .unwrap();
        let minted = SlotRef::new(CN0, 2);
        mint(&mut store, ep, minted, CapRights::READ, &mut minter).unwrap();
        let minted2 = SlotRef::new(CN0, 3);
        mint(&mut store, minted, minted2, CapRights::READ, &mut minter).unwrap();

        let mut reclaim = RecordingReclaim::default();
        let n = revoke(&mut store, ep, &mut reclaim).unwrap();

        assert_eq!(n, 3);
        assert!(store.slot(ep).unwrap().is_null());
        assert!(store.slot(minted).unwrap().is_null());
        assert!(store.slot(minted2).unwrap().is_null());
        // Children destroyed before the root.
        assert_eq!(reclaim.released.last().unwrap().0, ep);
        // The untyped's child list no longer references the endpoint.
        assert!(store.slot(slot0()).unwrap().first_child().is_null());
    }

    #[test]
    fn test_revoke_returns_frames() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Frame,
            SlotRef::new(CN0, 1),
            2,
            &mut minter,
            phys_data,
        )
        .unwrap();

        let mut reclaim = RecordingReclaim::default();
        let n = revoke(&mut store, slot0(), &mut reclaim).unwrap();
        assert_eq!(n, 3); // two frames + the untyped itself

        let frames: Vec<u64> = reclaim
            .released
            .iter()
            .filter(|(_, ty, _)| *ty == ObjectType::Frame)
            .map(|(_, _, d)| *d)
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.contains(&0x100_0000));
        assert!(frames.contains(&0x100_1000));
    }

    #[test]
    fn test_revoke_empties_cnode_contents() {
        let mut store = TestStore::new();
        // A CNode capability in cn0 slot 1 referring to cnode 1, which
        // holds a frame capability at slot 5.
        let cnode_cap = SlotRef::new(CN0, 1);
        *store.slot_mut(cnode_cap).unwrap() =
            CapSlot::new(ObjectType::CNode, CapRights::ALL, Badge::new(2), 1);
        let inner = SlotRef::new(CN1, 5);
        *store.slot_mut(inner).unwrap() =
            CapSlot::new(ObjectType::Frame, CapRights::RW, Badge::new(3), 0x4000);

        let mut reclaim = RecordingReclaim::default();
        let n = revoke(&mut store, cnode_cap, &mut reclaim).unwrap();
        assert_eq!(n, 2);
        assert!(store.slot(inner).unwrap().is_null());
        assert!(store.slot(cnode_cap).unwrap().is_null());
        // Frame released before the containing CNode.
        assert_eq!(reclaim.released[0].1, ObjectType::Frame);
        assert_eq!(reclaim.released[1].1, ObjectType::CNode);
    }

    #[test]
    fn test_transfer_copy_preserves_badge() {
        let mut store = TestStore::new();
        let src = SlotRef::new(CN0, 1);
        *store.slot_mut(src).unwrap() =
            CapSlot::new(ObjectType::Endpoint, CapRights::RW, Badge::new(0x42), 7);

        let dst = SlotRef::new(CN1, 3);
        transfer(&mut store, src, dst, false).unwrap();

        let copy = *store.slot(dst).unwrap();
        assert_eq!(copy.badge(), Badge::new(0x42));
        assert_eq!(copy.rights(), CapRights::RW);
        assert_eq!(copy.parent(), src);
        assert!(!store.slot(src).unwrap().is_null());
    }

    #[test]
    fn test_transfer_move_keeps_children() {
        let mut store = TestStore::new();
        let mut minter = BadgeMinter::new();
        let src = SlotRef::new(CN0, 1);
        *store.slot_mut(src).unwrap() =
            CapSlot::new(ObjectType::Endpoint, CapRights::ALL, Badge::new(0x42), 7);
        let child = SlotRef::new(CN0, 2);
        mint(&mut store, src, child, CapRights::READ, &mut minter).unwrap();

        let dst = SlotRef::new(CN1, 0);
        transfer(&mut store, src, dst, true).unwrap();

        assert!(store.slot(src).unwrap().is_null());
        let moved = *store.slot(dst).unwrap();
        assert_eq!(moved.badge(), Badge::new(0x42));
        assert_eq!(moved.first_child(), child);
        assert_eq!(store.slot(child).unwrap().parent(), dst);
    }

    #[test]
    fn test_delete_reparents_children() {
        let mut store = TestStore::new();
        let mut minter = BadgeMinter::new();
        let a = SlotRef::new(CN0, 1);
        *store.slot_mut(a).unwrap() =
            CapSlot::new(ObjectType::Endpoint, CapRights::ALL, Badge::new(1), 7);
        let b = SlotRef::new(CN0, 2);
        mint(&mut store, a, b, CapRights::ALL, &mut minter).unwrap();
        let c = SlotRef::new(CN0, 3);
        mint(&mut store, b, c, CapRights::ALL, &mut minter).unwrap();

        delete(&mut store, b).unwrap();

        assert!(store.slot(b).unwrap().is_null());
        assert_eq!(store.slot(c).unwrap().parent(), a);
        assert_eq!(store.slot(a).unwrap().first_child(), c);
        // c's subtree is intact: revoking a still reaches it.
        let mut reclaim = RecordingReclaim::default();
        let n = revoke(&mut store, a, &mut reclaim).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_originals_and_derived() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        let ep = SlotRef::new(CN0, 1);
        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            ep,
            1,
            &mut minter,
            |_, _| Ok(7),
        )
        .unwrap();
        assert!(store.slot(ep).unwrap().is_original());

        let minted = SlotRef::new(CN0, 2);
        mint(&mut store, ep, minted, CapRights::READ, &mut minter).unwrap();
        assert!(!store.slot(minted).unwrap().is_original());

        let copied = SlotRef::new(CN0, 3);
        transfer(&mut store, ep, copied, false).unwrap();
        assert!(!store.slot(copied).unwrap().is_original());

        // A move carries the original marker with the capability.
        let moved = SlotRef::new(CN1, 1);
        transfer(&mut store, ep, moved, true).unwrap();
        assert!(store.slot(moved).unwrap().is_original());
    }

    #[test]
    fn test_verify_badge() {
        let mut store = TestStore::new();
        let r = SlotRef::new(CN0, 1);
        *store.slot_mut(r).unwrap() =
            CapSlot::new(ObjectType::Endpoint, CapRights::RW, Badge::new(0x42), 7);

        assert!(verify(&store, r, Badge::new(0x42)).unwrap());
        assert!(!verify(&store, r, Badge::new(0x43)).unwrap());
        assert_eq!(
            verify(&store, SlotRef::new(CN0, 9), Badge::new(1)),
            Err(CapError::EmptySlot)
        );
    }

    #[test]
    fn test_retype_accounting_across_revoke() {
        let mut store = TestStore::new();
        let mut ut = seed_untyped(&mut store);
        let mut minter = BadgeMinter::new();
        retype(
            &mut store,
            &mut NullMemory,
            &mut ut,
            slot0(),
            ObjectType::Endpoint,
            SlotRef::new(CN0, 1),
            2,
            &mut minter,
            |i, _| Ok(i as u64),
        )
        .unwrap();
        assert_eq!(ut.watermark, 128);

        // Kernel-side reclaim reports each destroyed child back to the
        // untyped region; emulate that here.
        let mut reclaim = RecordingReclaim::default();
        revoke(&mut store, SlotRef::new(CN0, 1), &mut reclaim).unwrap();
        ut.release(64);
        revoke(&mut store, SlotRef::new(CN0, 2), &mut reclaim).unwrap();
        ut.release(64);

        assert_eq!(ut.watermark, 0);
        assert_eq!(ut.free_bytes(), 16 * 1024 * 1024);
    }
}
