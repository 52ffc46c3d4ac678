//! Memory operations: retype and frame mapping

use kozo_cap::{ops, CapRights, CapStore, ObjectType, SlotRef};
use kozo_common::memory::align_up;
use kozo_common::VirtAddr;
use kozo_syscall::SysError;

use crate::cap::{self, with_space, PhysZero};
use crate::ipc;
use crate::memory::layout::is_user_addr;
use crate::memory::paging::{self, MapError};
use crate::thread::pool;
use crate::thread::Tid;

use super::{caller_root, slot_arg};
use super::cap_ops::object_type_arg;

fn map_error_to_sys(e: MapError) -> SysError {
    match e {
        MapError::AlreadyMapped => SysError::NoSpace,
        MapError::TableAllocFailed => SysError::NoMem,
        MapError::NotMapped => SysError::InvalidState,
        MapError::BadAddress => SysError::Invalid,
    }
}

/// Retype(untyped_slot, obj_type, dest_slot, count).
pub fn retype(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    retype_objects(caller, args[0], args[1], args[2], args[3])
}

/// Shared implementation behind Retype, CapCreate and EndpointCreate.
pub(crate) fn retype_objects(
    caller: Tid,
    untyped_slot: u64,
    obj_type: u64,
    dest_slot: u64,
    count: u64,
) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let src = slot_arg(root, untyped_slot)?;
    let dest = slot_arg(root, dest_slot)?;
    let target = object_type_arg(obj_type)?;
    if count == 0 || count > 64 {
        return Err(SysError::Invalid);
    }
    let count = count as usize;

    with_space(|space| {
        let src_slot = *space.cnodes.slot(src).ok_or(SysError::Invalid)?;
        if src_slot.is_null() {
            return Err(SysError::NoCap);
        }
        if src_slot.cap_type() != ObjectType::Untyped {
            return Err(SysError::NoCap);
        }
        if !src_slot.has_rights(CapRights::WRITE) {
            return Err(SysError::AccessDenied);
        }
        let ut_index = src_slot.object_index();

        // CNodes must exist in the registry before their capability is
        // installed; the commit address is the watermark aligned up, so
        // pre-register against the predicted frames and unwind if the
        // retype fails.
        let mut premade_cnodes = [kozo_cap::CNodeId::new(0); 64];
        if target == ObjectType::CNode {
            let obj_size = kozo_cap::object_size(target).map_err(cap::cap_error_to_sys)?;
            let (base, size) = {
                let ut = space
                    .untypeds
                    .get_mut(ut_index)
                    .ok_or(SysError::InvalidState)?;
                (
                    ut.base
                        .offset(align_up(ut.watermark, kozo_cap::object_alignment(target))),
                    obj_size,
                )
            };
            for (i, slot) in premade_cnodes.iter_mut().enumerate().take(count) {
                *slot = space
                    .cnodes
                    .register(base.offset(i as u64 * size))
                    .ok_or(SysError::NoMem)?;
            }
        }

        let result = {
            // Split borrows: the engine walks the slot store while the
            // untyped registry hands out bytes.
            let CapSpaceParts {
                cnodes,
                untypeds,
                minter,
            } = split_space(space);
            let ut = untypeds.get_mut(ut_index).ok_or(SysError::InvalidState)?;

            ops::retype(
                cnodes,
                &mut PhysZero,
                ut,
                src,
                target,
                dest,
                count,
                minter,
                |i, phys| match target {
                    ObjectType::Frame | ObjectType::PageTable => Ok(phys.as_u64()),
                    ObjectType::AddressSpace => {
                        paging::init_address_space_root(phys);
                        Ok(phys.as_u64())
                    }
                    ObjectType::CNode => Ok(premade_cnodes[i].value() as u64),
                    ObjectType::Endpoint => ipc::endpoint::with_table(|t| {
                        t.alloc(0)
                            .map(|id| id as u64)
                            .ok_or(kozo_cap::CapError::OutOfMemory)
                    }),
                    ObjectType::Thread => {
                        let tid = pool::alloc_tcb().ok_or(kozo_cap::CapError::OutOfMemory)?;
                        Ok(tid as u64)
                    }
                    _ => Err(kozo_cap::CapError::InvalidOperation),
                },
            )
        };

        match result {
            Ok(()) => {
                // New endpoints remember the badge of their original
                // capability as the default sender identifier.
                if target == ObjectType::Endpoint {
                    for i in 0..count {
                        let r = SlotRef::new(dest.cnode(), dest.index() + i as u16);
                        if let Some(s) = space.cnodes.slot(r) {
                            let id = s.object_index() as u16;
                            let badge = s.badge().value();
                            ipc::endpoint::with_table(|t| {
                                if let Some(e) = t.get_mut(id) {
                                    e.default_badge = badge;
                                }
                            });
                        }
                    }
                }
                Ok(0)
            }
            Err(e) => {
                if target == ObjectType::CNode {
                    for id in premade_cnodes.iter().take(count) {
                        space.cnodes.release(*id);
                    }
                }
                Err(cap::cap_error_to_sys(e))
            }
        }
    })
}

/// Disjoint views of the capability space for the retype call.
struct CapSpaceParts<'a> {
    cnodes: &'a mut cap::CNodeRegistry,
    untypeds: &'a mut cap::UntypedRegistry,
    minter: &'a mut kozo_cap::BadgeMinter,
}

fn split_space(space: &mut cap::CapSpace) -> CapSpaceParts<'_> {
    CapSpaceParts {
        cnodes: &mut space.cnodes,
        untypeds: &mut space.untypeds,
        minter: &mut space.minter,
    }
}

/// MapFrame(frame_slot, vaddr, rights, attrs).
///
/// Maps the frame into the caller's address space. `rights` uses the
/// capability rights encoding (Write bit makes the page writable) and
/// must be covered by the capability; bit 0 of `attrs` requests an
/// executable mapping, which W^X downgrades for writable pages.
pub fn map_frame(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;
    let vaddr = VirtAddr::new(args[1]);
    let rights = CapRights::from_bits(args[2] as u8);
    let want_exec = args[3] & 1 != 0;

    if !vaddr.is_page_aligned() || !is_user_addr(vaddr) {
        return Err(SysError::Invalid);
    }

    let phys = with_space(|space| {
        let s = space.cnodes.slot(slot).ok_or(SysError::Invalid)?;
        if s.cap_type() != ObjectType::Frame {
            return Err(SysError::NoCap);
        }
        if !s.has_rights(CapRights::MAP) {
            return Err(SysError::AccessDenied);
        }
        if rights.has_write() && !s.has_rights(CapRights::WRITE) {
            return Err(SysError::AccessDenied);
        }
        Ok(s.phys())
    })?;

    let flags = paging::user_leaf_flags(rights.has_write(), want_exec);
    paging::map_page(vaddr, phys, flags).map_err(map_error_to_sys)?;
    Ok(0)
}

/// UnmapFrame(frame_slot, vaddr).
pub fn unmap_frame(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, args[0])?;
    let vaddr = VirtAddr::new(args[1]);

    if !vaddr.is_page_aligned() || !is_user_addr(vaddr) {
        return Err(SysError::Invalid);
    }

    let phys = with_space(|space| {
        let s = space.cnodes.slot(slot).ok_or(SysError::Invalid)?;
        if s.cap_type() != ObjectType::Frame {
            return Err(SysError::NoCap);
        }
        Ok(s.phys())
    })?;

    // The mapping being removed must be this capability's frame.
    match paging::translate(vaddr) {
        Some(mapped) if mapped == phys => {}
        Some(_) => return Err(SysError::AccessDenied),
        None => return Err(SysError::InvalidState),
    }

    paging::unmap_page(vaddr).map_err(map_error_to_sys)?;
    Ok(0)
}
