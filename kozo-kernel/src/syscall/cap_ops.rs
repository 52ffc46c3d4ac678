//! Capability-management operations

use kozo_cap::{ops, Badge, CapRights, ObjectType};
use kozo_syscall::SysError;

use crate::cap::{self, finish_reclaim, with_space, KernelReclaim, MAX_CNODES};
use crate::thread::Tid;

use super::{caller_root, slot_arg};

/// Decode an object-type argument.
pub(crate) fn object_type_arg(raw: u64) -> Result<ObjectType, SysError> {
    Ok(match raw {
        1 => ObjectType::Untyped,
        2 => ObjectType::CNode,
        3 => ObjectType::Endpoint,
        4 => ObjectType::Thread,
        5 => ObjectType::AddressSpace,
        6 => ObjectType::Frame,
        7 => ObjectType::PageTable,
        8 => ObjectType::IrqHandler,
        _ => return Err(SysError::Invalid),
    })
}

/// CapCreate(untyped_slot, obj_type, dest_slot): single-object retype.
pub fn cap_create(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    super::mem_ops::retype_objects(caller, args[0], args[1], args[2], 1)
}

/// CapDelete(slot): remove a capability, keeping its derivatives.
pub fn cap_delete(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;
    with_space(|space| ops::delete(&mut space.cnodes, slot).map_err(cap::cap_error_to_sys))?;
    Ok(0)
}

/// CapRevoke(slot): destroy the capability and its whole subtree.
pub fn cap_revoke(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;

    with_space(|space| {
        let mut reclaim = KernelReclaim::new(&mut space.untypeds);
        let destroyed = ops::revoke(&mut space.cnodes, slot, &mut reclaim)
            .map_err(cap::cap_error_to_sys)?;

        // Registry entries of CNodes that died during the traversal are
        // released now that the slot store is free again.
        let mut dead = [kozo_cap::CNodeId::new(0); MAX_CNODES];
        let mut n = 0;
        for id in reclaim.dead_cnodes() {
            dead[n] = id;
            n += 1;
        }
        drop(reclaim);
        finish_reclaim(space, &dead[..n]);

        Ok(destroyed as i64)
    })
}

/// CapTransfer(src_slot, dest_cnode_slot, dest_index, move_flag).
///
/// Requires the Grant right on the transferred capability; the
/// destination CNode is named by a CNode capability in the caller's
/// root.
pub fn cap_transfer(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let src = slot_arg(root, args[0])?;
    let dest_cnode_slot = slot_arg(root, args[1])?;
    let mv = args[3] != 0;

    with_space(|space| {
        use kozo_cap::CapStore;

        let src_slot = space.cnodes.slot(src).ok_or(SysError::Invalid)?;
        if src_slot.is_null() {
            return Err(SysError::NoCap);
        }
        if !src_slot.has_rights(CapRights::GRANT) {
            return Err(SysError::AccessDenied);
        }

        let dest_cnode = {
            let s = space.cnodes.slot(dest_cnode_slot).ok_or(SysError::Invalid)?;
            if s.cap_type() != ObjectType::CNode {
                return Err(SysError::NoCap);
            }
            kozo_cap::CNodeId::new(s.data() as u16)
        };
        let dst = slot_arg(dest_cnode, args[2])?;

        ops::transfer(&mut space.cnodes, src, dst, mv).map_err(cap::cap_error_to_sys)?;
        Ok(0)
    })
}

/// CapMint(src_slot, dest_slot, rights_mask): derive an attenuated
/// capability with a fresh badge. Returns the badge.
pub fn cap_mint(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let src = slot_arg(root, args[0])?;
    let dst = slot_arg(root, args[1])?;
    let mask = CapRights::from_bits(args[2] as u8);

    with_space(|space| {
        use kozo_cap::CapStore;

        let src_slot = space.cnodes.slot(src).ok_or(SysError::Invalid)?;
        if src_slot.is_null() {
            return Err(SysError::NoCap);
        }
        if !src_slot.has_rights(CapRights::GRANT) {
            return Err(SysError::AccessDenied);
        }

        let badge = ops::mint(&mut space.cnodes, src, dst, mask, &mut space.minter)
            .map_err(cap::cap_error_to_sys)?;
        Ok(badge.value() as i64)
    })
}

/// CapVerify(slot, badge): constant-time badge check. Returns 1 on
/// match, 0 otherwise.
pub fn cap_verify(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;
    let expected = Badge::new(args[1]);

    with_space(|space| {
        let matched =
            ops::verify(&space.cnodes, slot, expected).map_err(cap::cap_error_to_sys)?;
        Ok(matched as i64)
    })
}
