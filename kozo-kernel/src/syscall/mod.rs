//! Syscall dispatch
//!
//! The fast-syscall entry stub hands every kernel entry to
//! [`syscall_dispatch`] with the caller's saved registers. Dispatch is a
//! straight numbered match; argument marshalling and capability checks
//! live in the per-category handler modules.
//!
//! # Return discipline
//!
//! Handlers either produce a plain value — in which case the frame's
//! scratch registers are scrubbed to zero and `rax` carries the result —
//! or report that the thread blocked and woke with a register payload
//! already written into its frame (IPC), which must not be disturbed.

mod cap_ops;
mod debug_ops;
mod endpoint_ops;
mod ipc_ops;
mod mem_ops;
mod thread_ops;

use kozo_cap::{CNodeId, SlotRef, CNODE_SLOTS};
use kozo_syscall::{Sys, SysError};

use crate::arch::SyscallFrame;
use crate::sched;
use crate::thread::pool;
use crate::thread::Tid;

/// How a handler concluded.
pub enum Reply {
    /// Scrub the scratch registers and return this value in `rax`.
    Value(i64),
    /// The frame already holds the complete return state.
    FrameInPlace,
}

impl Reply {
    /// Fold a handler result into a reply.
    fn from_result(r: Result<i64, SysError>) -> Self {
        match r {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Value(e.as_i64()),
        }
    }
}

/// Entry point called by the assembly stub.
#[no_mangle]
pub extern "C" fn syscall_dispatch(frame: &mut SyscallFrame) {
    let number = frame.rax;
    let args = [
        frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9,
    ];

    match dispatch(number, &args) {
        Reply::Value(v) => {
            frame.scrub();
            frame.rax = v as u64;
        }
        Reply::FrameInPlace => {}
    }
}

fn dispatch(number: u64, args: &[u64; 6]) -> Reply {
    let Some(sys) = Sys::from_number(number) else {
        log::debug!("unknown operation {number}");
        return Reply::Value(SysError::Invalid.as_i64());
    };

    let caller = sched::current();
    log::trace!(
        "tid {} {} ({:#x}, {:#x}, {:#x})",
        caller,
        sys.name(),
        args[0],
        args[1],
        args[2]
    );

    match sys {
        Sys::CapCreate => Reply::from_result(cap_ops::cap_create(caller, args)),
        Sys::CapDelete => Reply::from_result(cap_ops::cap_delete(caller, args)),
        Sys::CapRevoke => Reply::from_result(cap_ops::cap_revoke(caller, args)),
        Sys::CapTransfer => Reply::from_result(cap_ops::cap_transfer(caller, args)),
        Sys::CapMint => Reply::from_result(cap_ops::cap_mint(caller, args)),
        Sys::CapVerify => Reply::from_result(cap_ops::cap_verify(caller, args)),

        Sys::IpcSend => ipc_ops::send(caller, args),
        Sys::IpcRecv => ipc_ops::recv(caller, args),
        Sys::IpcCall => ipc_ops::call(caller, args),
        Sys::IpcReplyWait => ipc_ops::reply_wait(caller, args),

        Sys::Retype => Reply::from_result(mem_ops::retype(caller, args)),
        Sys::MapFrame => Reply::from_result(mem_ops::map_frame(caller, args)),
        Sys::UnmapFrame => Reply::from_result(mem_ops::unmap_frame(caller, args)),

        Sys::ThreadCreate => Reply::from_result(thread_ops::thread_create(caller, args)),
        Sys::ThreadResume => Reply::from_result(thread_ops::thread_resume(caller, args)),
        Sys::ThreadSuspend => Reply::from_result(thread_ops::thread_suspend(caller, args)),
        Sys::ThreadSetPriority => {
            Reply::from_result(thread_ops::thread_set_priority(caller, args))
        }

        Sys::EndpointCreate => Reply::from_result(endpoint_ops::endpoint_create(caller, args)),
        Sys::EndpointDelete => Reply::from_result(endpoint_ops::endpoint_delete(caller, args)),
        Sys::NamespaceRegister => {
            Reply::from_result(endpoint_ops::namespace_register(caller, args))
        }

        Sys::DebugDumpCaps => Reply::from_result(debug_ops::dump_caps(caller)),
        Sys::DebugPutchar => Reply::from_result(debug_ops::putchar(args)),
    }
}

// -- Shared handler plumbing

/// Root CNode of the calling thread.
pub(crate) fn caller_root(caller: Tid) -> Result<CNodeId, SysError> {
    pool::with_tcb(caller, |tcb| tcb.cap_root).ok_or(SysError::Invalid)
}

/// Turn a raw slot-index argument into a slot reference in `cnode`.
pub(crate) fn slot_arg(cnode: CNodeId, index: u64) -> Result<SlotRef, SysError> {
    if index as usize >= CNODE_SLOTS {
        return Err(SysError::Invalid);
    }
    Ok(SlotRef::new(cnode, index as u16))
}
