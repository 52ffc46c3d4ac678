//! Thread operations

use kozo_cap::{ops, CapRights, CapStore, ObjectType, SlotRef, CNODE_SLOTS};
use kozo_common::VirtAddr;
use kozo_syscall::SysError;

use crate::cap::{self, bootstrap, with_space};
use crate::memory::layout::is_user_addr;
use crate::sched;
use crate::thread::pool;
use crate::thread::{setup_thread, ThreadState, Tid};

use super::{caller_root, slot_arg};

/// Find the first free slot in a CNode at or above the boot-reserved
/// range.
fn find_free_slot(store: &impl CapStore, cnode: kozo_cap::CNodeId) -> Option<u16> {
    (bootstrap::FIRST_FREE_SLOT..CNODE_SLOTS as u16)
        .find(|&i| store.slot(SlotRef::new(cnode, i)).is_some_and(|s| s.is_null()))
}

/// ThreadCreate(aspace_slot, entry, user_sp, cnode_slot).
///
/// Allocates a TCB, binds it to the given address space and capability
/// root, and prepares it to enter user mode at `entry`. The thread
/// starts Suspended; its capability lands in the first free slot of the
/// caller's root CNode, whose index is the return value.
pub fn thread_create(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let root = caller_root(caller)?;
    let aspace_slot = slot_arg(root, args[0])?;
    let entry = VirtAddr::new(args[1]);
    let user_sp = VirtAddr::new(args[2]);
    let cnode_slot = slot_arg(root, args[3])?;

    if !is_user_addr(entry) || !is_user_addr(user_sp) {
        return Err(SysError::Invalid);
    }

    with_space(|space| {
        let aspace = *space.cnodes.slot(aspace_slot).ok_or(SysError::Invalid)?;
        if aspace.cap_type() != ObjectType::AddressSpace {
            return Err(SysError::NoCap);
        }
        if !aspace.has_rights(CapRights::WRITE) {
            return Err(SysError::AccessDenied);
        }

        let cap_root = {
            let s = space.cnodes.slot(cnode_slot).ok_or(SysError::Invalid)?;
            if s.cap_type() != ObjectType::CNode {
                return Err(SysError::NoCap);
            }
            kozo_cap::CNodeId::new(s.data() as u16)
        };

        let tid = pool::alloc_tcb().ok_or(SysError::NoMem)?;
        pool::with_tcb(tid, |tcb| {
            tcb.address_space = aspace.phys();
            tcb.cap_root = cap_root;
            setup_thread(tcb, entry, user_sp, true);
        });

        let dest_index = match find_free_slot(&space.cnodes, root) {
            Some(i) => i,
            None => {
                pool::free_tcb(tid);
                return Err(SysError::NoSpace);
            }
        };
        let dest = SlotRef::new(root, dest_index);

        // The thread capability derives from the address space it runs
        // in: revoking the address space takes its threads with it.
        if let Err(e) = ops::install_child(
            &mut space.cnodes,
            aspace_slot,
            dest,
            ObjectType::Thread,
            aspace.rights(),
            tid as u64,
            &mut space.minter,
        ) {
            pool::free_tcb(tid);
            return Err(cap::cap_error_to_sys(e));
        }

        Ok(dest_index as i64)
    })
}

/// Resolve a Thread capability to its TID.
fn resolve_thread(caller: Tid, slot_index: u64) -> Result<Tid, SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, slot_index)?;
    with_space(|space| {
        let s = space.cnodes.slot(slot).ok_or(SysError::Invalid)?;
        if s.cap_type() != ObjectType::Thread {
            return Err(SysError::NoCap);
        }
        Ok(s.object_index() as Tid)
    })
}

/// ThreadResume(thread_slot): make a Suspended thread Runnable.
pub fn thread_resume(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let tid = resolve_thread(caller, args[0])?;
    let (state, configured) = pool::with_tcb(tid, |tcb| {
        (tcb.state, !tcb.kernel_stack_top.is_null())
    })
    .ok_or(SysError::Invalid)?;
    if state != ThreadState::Suspended {
        return Err(SysError::InvalidState);
    }
    // A retyped but never-configured TCB has no runnable context yet.
    if !configured {
        return Err(SysError::InvalidState);
    }
    sched::unblock(tid);
    Ok(0)
}

/// ThreadSuspend(thread_slot).
pub fn thread_suspend(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let tid = resolve_thread(caller, args[0])?;

    if tid == caller {
        // Self-suspend: stop here until someone resumes us.
        sched::block(ThreadState::Suspended);
        return Ok(0);
    }

    let state = pool::with_tcb(tid, |tcb| tcb.state).ok_or(SysError::Invalid)?;
    match state {
        ThreadState::Runnable => {
            if !sched::remove_thread(tid) {
                return Err(SysError::InvalidState);
            }
            pool::with_tcb(tid, |tcb| tcb.state = ThreadState::Suspended);
            Ok(0)
        }
        ThreadState::Suspended => Ok(0),
        // Threads parked on endpoints stay where they are; suspending
        // them there would corrupt the rendezvous protocol.
        _ => Err(SysError::InvalidState),
    }
}

/// ThreadSetPriority(thread_slot, priority).
///
/// Priorities grow downward (0 strongest, 255 is idle). A thread cannot
/// hand out a priority stronger than its own.
pub fn thread_set_priority(caller: Tid, args: &[u64; 6]) -> Result<i64, SysError> {
    let tid = resolve_thread(caller, args[0])?;
    let priority = args[1];
    if priority > u8::MAX as u64 {
        return Err(SysError::Invalid);
    }
    let priority = priority as u8;

    let caller_priority = pool::with_tcb(caller, |tcb| tcb.priority).ok_or(SysError::Invalid)?;
    if priority < caller_priority {
        return Err(SysError::AccessDenied);
    }

    pool::with_tcb(tid, |tcb| tcb.priority = priority).ok_or(SysError::Invalid)?;
    Ok(0)
}
