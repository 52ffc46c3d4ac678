//! Synchronous IPC
//!
//! Rendezvous messaging over endpoints. The fast path is the direct
//! switch: when a Call finds a receiver already waiting, the processor
//! moves straight from client to server without a scheduler round trip.
//! The critical ordering is fixed before the switch happens — the
//! receiver is made Running and the caller BlockedReply first — and all
//! kernel code runs with interrupts off, so no preemption can observe a
//! half-updated state.
//!
//! The badge a server observes is the badge stored in the capability the
//! client invoked, injected by the kernel into the server's first
//! argument register; clients cannot influence it.

pub mod endpoint;
pub mod message;

pub use endpoint::{EndpointId, MAX_ENDPOINTS};
pub use message::Message;

use kozo_syscall::SysError;

use crate::sched;
use crate::thread::pool;
use crate::thread::{ThreadState, Tid, NO_ENDPOINT, NO_THREAD};

use endpoint::{queue_pop, queue_push, queue_remove, with_table};

/// Length, in words, reported to a receiver on wake-up.
const MSG_WORDS: i64 = 3;

/// How an IPC operation concluded, from the caller's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation finished; the given value goes in `rax` and the
    /// scratch registers are scrubbed.
    Value(i64),
    /// The thread blocked and has been woken with its saved frame fully
    /// written (payload registers included); nothing may be overwritten.
    FrameDelivered,
}

/// Fill a frame with a message delivery.
///
/// The badge lands in the first argument register, the payload in the
/// three message registers, the caller's TID (zero for a plain send) in
/// `r8`, and the word count in the return register. Everything else is
/// scrubbed.
fn write_message_frame(frame: &mut crate::arch::SyscallFrame, badge: u64, msg: Message, caller: Tid) {
    frame.scrub();
    frame.rax = MSG_WORDS as u64;
    frame.rdi = badge;
    frame.rsi = msg.0[0];
    frame.rdx = msg.0[1];
    frame.r10 = msg.0[2];
    frame.r8 = if caller == NO_THREAD { 0 } else { caller as u64 };
}

/// Fill a frame with a two-word reply: success in the return register,
/// the reply words in the first two message registers, the rest zero.
fn write_reply_frame(frame: &mut crate::arch::SyscallFrame, r0: u64, r1: u64) {
    frame.scrub();
    frame.rax = 0;
    frame.rsi = r0;
    frame.rdx = r1;
}

/// Fill a frame with an error wake-up.
fn write_error_frame(frame: &mut crate::arch::SyscallFrame, err: SysError) {
    frame.scrub();
    frame.rax = err.as_i64() as u64;
}

/// Write a delivery into a blocked thread's saved frame.
///
/// # Safety contract (internal)
///
/// The target must be blocked inside the syscall path, so its frame slot
/// below the kernel stack top is live and nothing else touches it.
fn deliver_to_frame(target: Tid, badge: u64, msg: Message, caller: Tid) {
    pool::with_tcb(target, |tcb| {
        let frame = tcb.trap_frame();
        // SAFETY: See above; the thread is blocked, its frame is stable.
        unsafe { write_message_frame(&mut *frame, badge, msg, caller) }
    });
}

/// Write a two-word reply into a client's saved frame.
fn deliver_reply_to_frame(client: Tid, r0: u64, r1: u64) {
    pool::with_tcb(client, |tcb| {
        let frame = tcb.trap_frame();
        // SAFETY: The client is BlockedReply inside the syscall path.
        unsafe { write_reply_frame(&mut *frame, r0, r1) }
    });
}

/// Write an error into a blocked thread's saved frame (endpoint torn
/// down underneath it).
fn deliver_error_to_frame(target: Tid, err: SysError) {
    pool::with_tcb(target, |tcb| {
        let frame = tcb.trap_frame();
        // SAFETY: The thread is blocked inside the syscall path.
        unsafe { write_error_frame(&mut *frame, err) }
    });
}

/// Call: send three words, wait for the reply.
///
/// `timeout` semantics: 0 blocks until a receiver takes the message; any
/// non-zero value makes the operation fail immediately with `WouldBlock`
/// when no receiver is waiting.
pub fn call(
    caller: Tid,
    ep: EndpointId,
    badge: u64,
    msg: Message,
    timeout: u64,
) -> Result<Outcome, SysError> {
    // Fast path: a receiver is parked on the endpoint.
    let receiver = with_table(|t| {
        let e = t.get_mut(ep).ok_or(SysError::InvalidState)?;
        Ok::<_, SysError>(pool::with_pool(|p| {
            queue_pop(p, &mut e.recv_head, &mut e.recv_tail)
        }))
    })?;

    match receiver {
        Some(receiver) => {
            deliver_to_frame(receiver, badge, msg, caller);
            pool::with_tcb(receiver, |tcb| {
                tcb.blocked_on = NO_ENDPOINT;
                tcb.state = ThreadState::Runnable;
            });
            // Direct switch: the caller must be observably BlockedReply
            // before the processor moves.
            pool::with_tcb(caller, |tcb| tcb.state = ThreadState::BlockedReply);
            sched::switch_to(receiver);
            // Execution resumes here after the server's reply; the frame
            // holds the reply words.
            Ok(Outcome::FrameDelivered)
        }
        None if timeout != 0 => Err(SysError::WouldBlock),
        None => {
            // Park on the send queue with the message stashed.
            pool::with_tcb(caller, |tcb| {
                tcb.ipc_msg = msg.0;
                tcb.ipc_badge = badge;
                tcb.is_call = true;
                tcb.blocked_on = ep;
            });
            with_table(|t| {
                if let Some(e) = t.get_mut(ep) {
                    pool::with_pool(|p| {
                        queue_push(p, &mut e.send_head, &mut e.send_tail, caller)
                    });
                }
            });
            sched::block(ThreadState::BlockedSend);
            Ok(Outcome::FrameDelivered)
        }
    }
}

/// Send: one-way three-word message; never queues the sender.
pub fn send(sender: Tid, ep: EndpointId, badge: u64, msg: Message) -> Result<Outcome, SysError> {
    let receiver = with_table(|t| {
        let e = t.get_mut(ep).ok_or(SysError::InvalidState)?;
        Ok::<_, SysError>(pool::with_pool(|p| {
            queue_pop(p, &mut e.recv_head, &mut e.recv_tail)
        }))
    })?;

    let Some(receiver) = receiver else {
        return Err(SysError::WouldBlock);
    };

    deliver_to_frame(receiver, badge, msg, NO_THREAD);
    pool::with_tcb(receiver, |tcb| {
        tcb.blocked_on = NO_ENDPOINT;
        tcb.state = ThreadState::Runnable;
    });
    // The sender stays runnable; hand the processor to the receiver and
    // take our place in the queue.
    pool::with_tcb(sender, |tcb| tcb.state = ThreadState::Runnable);
    sched::enqueue(sender);
    sched::switch_to(receiver);
    Ok(Outcome::Value(0))
}

/// Recv: block until a message arrives; deliver queued senders first.
pub fn recv(receiver: Tid, ep: EndpointId) -> Result<Outcome, SysError> {
    let sender = with_table(|t| {
        let e = t.get_mut(ep).ok_or(SysError::InvalidState)?;
        Ok::<_, SysError>(pool::with_pool(|p| {
            queue_pop(p, &mut e.send_head, &mut e.send_tail)
        }))
    })?;

    match sender {
        Some(sender) => {
            let (msg, badge, is_call) = pool::with_tcb(sender, |tcb| {
                tcb.blocked_on = NO_ENDPOINT;
                (Message(tcb.ipc_msg), tcb.ipc_badge, tcb.is_call)
            })
            .ok_or(SysError::Invalid)?;

            deliver_to_frame(
                receiver,
                badge,
                msg,
                if is_call { sender } else { NO_THREAD },
            );

            if is_call {
                // The sender's Call continues to wait, now for the reply.
                pool::with_tcb(sender, |tcb| {
                    tcb.state = ThreadState::BlockedReply;
                    tcb.is_call = false;
                });
            } else {
                // A plain send completes as soon as it is consumed.
                pool::with_tcb(sender, |tcb| {
                    let frame = tcb.trap_frame();
                    // SAFETY: The sender is blocked in the syscall path.
                    unsafe {
                        (*frame).scrub();
                        (*frame).rax = 0;
                    }
                });
                sched::unblock(sender);
            }
            Ok(Outcome::FrameDelivered)
        }
        None => {
            park_receiver(receiver, ep);
            Ok(Outcome::FrameDelivered)
        }
    }
}

/// ReplyWait: reply to the previous caller, then wait for the next
/// message, atomically from the client's point of view.
pub fn reply_wait(
    server: Tid,
    client_tid: u64,
    r0: u64,
    r1: u64,
    ep: EndpointId,
) -> Result<Outcome, SysError> {
    if client_tid != 0 {
        let client = client_tid as Tid;
        if client_tid >= crate::thread::MAX_THREADS as u64 {
            return Err(SysError::NoCaller);
        }
        let is_waiting = pool::with_tcb(client, |tcb| tcb.state == ThreadState::BlockedReply)
            .unwrap_or(false);
        if !is_waiting {
            return Err(SysError::NoCaller);
        }
        deliver_reply_to_frame(client, r0, r1);
        sched::unblock(client);
    }

    // The reply is already observable; now take the next message.
    recv(server, ep)
}

/// Park a receiver on the endpoint's receive queue and block.
fn park_receiver(receiver: Tid, ep: EndpointId) {
    // The wait starts with clean message registers.
    pool::with_tcb(receiver, |tcb| {
        tcb.blocked_on = ep;
        let frame = tcb.trap_frame();
        // SAFETY: We are the receiver, inside our own syscall frame.
        unsafe {
            (*frame).scrub();
        }
    });
    with_table(|t| {
        if let Some(e) = t.get_mut(ep) {
            pool::with_pool(|p| queue_push(p, &mut e.recv_head, &mut e.recv_tail, receiver));
        }
    });
    sched::block(ThreadState::BlockedRecv);
}

/// Tear down an endpoint: wake every queued thread with an error and
/// free the table entry. Used by EndpointDelete and by revocation.
pub fn destroy_endpoint(ep: EndpointId) {
    let woken = with_table(|t| {
        let mut woken = [NO_THREAD; crate::thread::MAX_THREADS];
        let mut n = 0;
        if let Some(e) = t.get_mut(ep) {
            pool::with_pool(|p| {
                while let Some(tid) = queue_pop(p, &mut e.send_head, &mut e.send_tail) {
                    woken[n] = tid;
                    n += 1;
                }
                while let Some(tid) = queue_pop(p, &mut e.recv_head, &mut e.recv_tail) {
                    woken[n] = tid;
                    n += 1;
                }
            });
            t.free(ep);
        }
        woken
    });

    for &tid in woken.iter().take_while(|&&t| t != NO_THREAD) {
        deliver_error_to_frame(tid, SysError::InvalidState);
        pool::with_tcb(tid, |tcb| {
            tcb.blocked_on = NO_ENDPOINT;
            tcb.is_call = false;
        });
        sched::unblock(tid);
    }

    crate::namespace::purge_endpoint(ep);
}

/// Drop a thread from whatever endpoint queue it waits on (thread
/// revocation while BlockedSend/BlockedRecv).
pub fn remove_from_endpoint(tid: Tid) {
    let ep = pool::with_tcb(tid, |tcb| tcb.blocked_on).unwrap_or(NO_ENDPOINT);
    if ep == NO_ENDPOINT {
        return;
    }
    with_table(|t| {
        if let Some(e) = t.get_mut(ep) {
            pool::with_pool(|p| {
                if !queue_remove(p, &mut e.send_head, &mut e.send_tail, tid) {
                    queue_remove(p, &mut e.recv_head, &mut e.recv_tail, tid);
                }
            });
        }
    });
    pool::with_tcb(tid, |tcb| tcb.blocked_on = NO_ENDPOINT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SyscallFrame;

    fn dirty_frame() -> SyscallFrame {
        SyscallFrame {
            rax: 0x11,
            rdi: 0x22,
            rsi: 0x33,
            rdx: 0x44,
            r10: 0x55,
            r8: 0x66,
            r9: 0x77,
            rcx: 0x88,
            r11: 0x99,
            rsp: 0xAA,
        }
    }

    #[test]
    fn test_badge_injection() {
        // The badge of the invoked capability reaches the receiver's
        // first argument register, whichever minted sibling it was.
        let mut frame = dirty_frame();
        write_message_frame(&mut frame, 0x42, Message::new(0xAA, 0xBB, 0xCC), 7);
        assert_eq!(frame.rdi, 0x42);
        assert_eq!((frame.rsi, frame.rdx, frame.r10), (0xAA, 0xBB, 0xCC));
        assert_eq!(frame.r8, 7);
        assert_eq!(frame.rax, 3);
        // Leftover caller state never leaks through a wake-up.
        assert_eq!(frame.r9, 0);
    }

    #[test]
    fn test_plain_send_carries_no_caller() {
        let mut frame = dirty_frame();
        write_message_frame(&mut frame, 0x42, Message::new(1, 2, 3), NO_THREAD);
        assert_eq!(frame.r8, 0);
    }

    #[test]
    fn test_reply_frame_contract() {
        let mut frame = dirty_frame();
        write_reply_frame(&mut frame, 0x11, 0x22);
        assert_eq!(frame.rax, 0);
        assert_eq!((frame.rsi, frame.rdx), (0x11, 0x22));
        // Only the two reply words are delivered.
        assert_eq!(frame.r10, 0);
        assert_eq!(frame.rdi, 0);
        assert_eq!(frame.r8, 0);
    }

    #[test]
    fn test_error_frame() {
        let mut frame = dirty_frame();
        write_error_frame(&mut frame, SysError::InvalidState);
        assert_eq!(frame.rax as i64, SysError::InvalidState.as_i64());
        assert_eq!(frame.rdi | frame.rsi | frame.rdx | frame.r10 | frame.r8, 0);
    }
}
