//! Endpoint and naming operations

use kozo_cap::{CapStore, ObjectType};
use kozo_common::VirtAddr;
use kozo_syscall::SysError;

use crate::cap::with_space;
use crate::ipc::EndpointId;
use crate::memory::layout::is_user_addr;
use crate::namespace;
use crate::thread::Tid;

use super::{caller_root, slot_arg};

/// EndpointCreate(untyped_slot, dest_slot): retype an Untyped region
/// into a fresh endpoint.
pub fn endpoint_create(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    super::mem_ops::retype_objects(
        caller,
        args[0],
        ObjectType::Endpoint as u64,
        args[1],
        1,
    )
}

/// EndpointDelete(endpoint_slot): destroy the endpoint via revocation of
/// its capability subtree. Every thread queued on it wakes with an
/// error; minted handles elsewhere die with the object.
pub fn endpoint_delete(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;

    let is_endpoint = with_space(|space| {
        space
            .cnodes
            .slot(slot)
            .map(|s| s.cap_type() == ObjectType::Endpoint)
            .unwrap_or(false)
    });
    if !is_endpoint {
        return Err(SysError::NoCap);
    }

    super::cap_ops::cap_revoke(caller, args).map(|_| 0)
}

/// NamespaceRegister(endpoint_slot, name_ptr, name_len).
///
/// Publishes an endpoint under a short UTF-8 name so services can find
/// each other. The name is copied out of the caller's address space,
/// which is active for the duration of the call.
pub fn namespace_register(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;
    let name_ptr = VirtAddr::new(args[1]);
    let name_len = args[2] as usize;

    if name_len == 0 || name_len > namespace::MAX_NAME_LEN {
        return Err(SysError::Invalid);
    }
    let end = name_ptr.as_u64().checked_add(name_len as u64).ok_or(SysError::Invalid)?;
    if !is_user_addr(name_ptr) || !is_user_addr(VirtAddr::new(end)) {
        return Err(SysError::Invalid);
    }

    let endpoint = with_space(|space| {
        let s = space.cnodes.slot(slot).ok_or(SysError::Invalid)?;
        if s.cap_type() != ObjectType::Endpoint {
            return Err(SysError::NoCap);
        }
        if !s.has_rights(kozo_cap::CapRights::GRANT) {
            return Err(SysError::AccessDenied);
        }
        Ok(s.object_index() as EndpointId)
    })?;

    let mut name_buf = [0u8; namespace::MAX_NAME_LEN];
    // SAFETY: The range was validated against the user-space bounds and
    // the caller's address space is active; a fault here kills only the
    // calling thread.
    unsafe {
        core::ptr::copy_nonoverlapping(
            name_ptr.as_ptr::<u8>(),
            name_buf.as_mut_ptr(),
            name_len,
        );
    }
    let name = core::str::from_utf8(&name_buf[..name_len]).map_err(|_| SysError::Invalid)?;

    namespace::register(name, endpoint)?;
    Ok(0)
}
