//! IPC operations
//!
//! Thin shims: resolve the endpoint capability, check the direction
//! right (Write to send, Read to receive), and hand over to the IPC
//! core with the badge of the *invoked* capability.

use kozo_cap::{CapRights, CapStore, ObjectType};
use kozo_syscall::SysError;

use crate::cap::with_space;
use crate::ipc::{self, EndpointId, Message, Outcome};
use crate::thread::Tid;

use super::{caller_root, slot_arg, Reply};

/// Resolve an endpoint capability, returning `(endpoint, badge)`.
fn resolve_endpoint(
    caller: Tid,
    slot_index: u64,
    required: CapRights,
) -> Result<(EndpointId, u64), SysError> {
    let root = caller_root(caller)?;
    let slot = slot_arg(root, slot_index)?;
    with_space(|space| {
        let s = space.cnodes.slot(slot).ok_or(SysError::Invalid)?;
        if s.cap_type() != ObjectType::Endpoint {
            return Err(SysError::NoCap);
        }
        if !s.has_rights(required) {
            return Err(SysError::AccessDenied);
        }
        Ok((s.object_index() as EndpointId, s.badge().value()))
    })
}

fn outcome_to_reply(r: Result<Outcome, SysError>) -> Reply {
    match r {
        Ok(Outcome::Value(v)) => Reply::Value(v),
        Ok(Outcome::FrameDelivered) => Reply::FrameInPlace,
        Err(e) => Reply::Value(e.as_i64()),
    }
}

/// IpcSend(endpoint, m0, m1, m2).
pub fn send(caller: Tid, args: &[u64; 6]) -> Reply {
    let resolved = resolve_endpoint(caller, args[0], CapRights::WRITE);
    match resolved {
        Ok((ep, badge)) => outcome_to_reply(ipc::send(
            caller,
            ep,
            badge,
            Message::new(args[1], args[2], args[3]),
        )),
        Err(e) => Reply::Value(e.as_i64()),
    }
}

/// IpcRecv(endpoint).
pub fn recv(caller: Tid, args: &[u64; 6]) -> Reply {
    let resolved = resolve_endpoint(caller, args[0], CapRights::READ);
    match resolved {
        Ok((ep, _badge)) => outcome_to_reply(ipc::recv(caller, ep)),
        Err(e) => Reply::Value(e.as_i64()),
    }
}

/// IpcCall(endpoint, m0, m1, m2, timeout).
pub fn call(caller: Tid, args: &[u64; 6]) -> Reply {
    let resolved = resolve_endpoint(caller, args[0], CapRights::WRITE);
    match resolved {
        Ok((ep, badge)) => outcome_to_reply(ipc::call(
            caller,
            ep,
            badge,
            Message::new(args[1], args[2], args[3]),
            args[4],
        )),
        Err(e) => Reply::Value(e.as_i64()),
    }
}

/// IpcReplyWait(client_tid, r0, r1, endpoint).
pub fn reply_wait(caller: Tid, args: &[u64; 6]) -> Reply {
    let resolved = resolve_endpoint(caller, args[3], CapRights::READ);
    match resolved {
        Ok((ep, _badge)) => {
            outcome_to_reply(ipc::reply_wait(caller, args[0], args[1], args[2], ep))
        }
        Err(e) => Reply::Value(e.as_i64()),
    }
}
