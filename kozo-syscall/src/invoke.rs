//! Raw syscall invocation for user-level services
//!
//! The raw primitives issue the `syscall` instruction directly; the safe
//! wrappers below them marshal arguments and decode the signed return
//! value. All inline assembly in the user-facing ABI is confined to this
//! module.
//!
//! Note the fourth argument travels in `r10`: the CPU overwrites `rcx`
//! (and `r11`) as part of `syscall` itself.

#![cfg(target_arch = "x86_64")]

use core::arch::asm;

use crate::error::{decode, SysResult};
use crate::numbers::Sys;

/// Issue an operation with no arguments.
///
/// # Safety
///
/// The operation number must be valid for a zero-argument call.
#[inline(always)]
pub unsafe fn syscall0(n: Sys) -> i64 {
    let ret: i64;
    // SAFETY: The syscall clobbers only rcx/r11 beyond the declared
    // operands; the kernel scrubs everything else.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

/// Issue an operation with one argument.
///
/// # Safety
///
/// As [`syscall0`]; the argument must match the operation's contract.
#[inline(always)]
pub unsafe fn syscall1(n: Sys, a0: u64) -> i64 {
    let ret: i64;
    // SAFETY: See syscall0.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            in("rdi") a0,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

/// Issue an operation with two arguments.
///
/// # Safety
///
/// As [`syscall0`].
#[inline(always)]
pub unsafe fn syscall2(n: Sys, a0: u64, a1: u64) -> i64 {
    let ret: i64;
    // SAFETY: See syscall0.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            in("rdi") a0,
            in("rsi") a1,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

/// Issue an operation with three arguments.
///
/// # Safety
///
/// As [`syscall0`].
#[inline(always)]
pub unsafe fn syscall3(n: Sys, a0: u64, a1: u64, a2: u64) -> i64 {
    let ret: i64;
    // SAFETY: See syscall0.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            in("rdi") a0,
            in("rsi") a1,
            in("rdx") a2,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

/// Issue an operation with four arguments.
///
/// # Safety
///
/// As [`syscall0`].
#[inline(always)]
pub unsafe fn syscall4(n: Sys, a0: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let ret: i64;
    // SAFETY: See syscall0.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            in("rdi") a0,
            in("rsi") a1,
            in("rdx") a2,
            in("r10") a3,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

/// Issue an operation with five arguments.
///
/// # Safety
///
/// As [`syscall0`].
#[inline(always)]
pub unsafe fn syscall5(n: Sys, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    let ret: i64;
    // SAFETY: See syscall0.
    unsafe {
        asm!(
            "syscall",
            in("rax") n as u64,
            in("rdi") a0,
            in("rsi") a1,
            in("rdx") a2,
            in("r10") a3,
            in("r8") a4,
            lateout("rax") ret,
            out("rcx") _, out("r11") _,
            options(nostack, preserves_flags)
        );
    }
    ret
}

// === Capability management ===

/// Retype untyped memory into `count` new kernel objects.
pub fn sys_retype(untyped_slot: u64, obj_type: u64, dest_slot: u64, count: u64) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::Retype, untyped_slot, obj_type, dest_slot, count) })
}

/// Create a single capability from untyped memory.
pub fn sys_cap_create(untyped_slot: u64, obj_type: u64, dest_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall3(Sys::CapCreate, untyped_slot, obj_type, dest_slot) })
}

/// Remove a capability from its slot, leaving derivatives intact.
pub fn sys_cap_delete(slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::CapDelete, slot) })
}

/// Destroy a capability and every capability derived from it.
pub fn sys_cap_revoke(slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::CapRevoke, slot) })
}

/// Copy (`mv == false`) or move a capability to another CNode.
pub fn sys_cap_transfer(src_slot: u64, dest_cnode: u64, dest_slot: u64, mv: bool) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::CapTransfer, src_slot, dest_cnode, dest_slot, mv as u64) })
}

/// Mint an attenuated capability; returns the fresh badge.
pub fn sys_cap_mint(src_slot: u64, dest_slot: u64, rights_mask: u64) -> SysResult<u64> {
    decode(unsafe { syscall3(Sys::CapMint, src_slot, dest_slot, rights_mask) })
}

/// Verify a capability's badge; returns 1 on match, 0 otherwise.
pub fn sys_cap_verify(slot: u64, badge: u64) -> SysResult<u64> {
    decode(unsafe { syscall2(Sys::CapVerify, slot, badge) })
}

// === IPC ===

/// Send a three-word message; `WouldBlock` if no receiver is waiting.
pub fn sys_ipc_send(endpoint_slot: u64, m0: u64, m1: u64, m2: u64) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::IpcSend, endpoint_slot, m0, m1, m2) })
}

/// Block until a message arrives on the endpoint.
///
/// On return the sender's badge is in the first argument register and the
/// message words in the following three; the return value is the message
/// length in words.
pub fn sys_ipc_recv(endpoint_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::IpcRecv, endpoint_slot) })
}

/// Call: send three words and wait for the two-word reply.
///
/// `timeout` 0 blocks forever; any other value makes the operation fail
/// immediately with `WouldBlock` when no receiver is waiting.
pub fn sys_ipc_call(endpoint_slot: u64, m0: u64, m1: u64, m2: u64, timeout: u64) -> SysResult<u64> {
    decode(unsafe { syscall5(Sys::IpcCall, endpoint_slot, m0, m1, m2, timeout) })
}

/// Reply two words to `client_tid`, then wait on the endpoint.
pub fn sys_ipc_reply_wait(client_tid: u64, r0: u64, r1: u64, endpoint_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::IpcReplyWait, client_tid, r0, r1, endpoint_slot) })
}

// === Memory ===

/// Map a frame capability at `vaddr` in the caller's address space.
pub fn sys_map_frame(frame_slot: u64, vaddr: u64, rights: u64, attrs: u64) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::MapFrame, frame_slot, vaddr, rights, attrs) })
}

/// Remove the mapping of a frame at `vaddr`.
pub fn sys_unmap_frame(frame_slot: u64, vaddr: u64) -> SysResult<u64> {
    decode(unsafe { syscall2(Sys::UnmapFrame, frame_slot, vaddr) })
}

// === Threads ===

/// Create a thread; returns the slot index of its Thread capability.
pub fn sys_thread_create(aspace_slot: u64, entry: u64, user_sp: u64, cnode_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall4(Sys::ThreadCreate, aspace_slot, entry, user_sp, cnode_slot) })
}

/// Make a suspended thread runnable.
pub fn sys_thread_resume(thread_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::ThreadResume, thread_slot) })
}

/// Suspend a thread.
pub fn sys_thread_suspend(thread_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::ThreadSuspend, thread_slot) })
}

/// Set a thread's priority. Raising above the caller's own priority is
/// refused with `AccessDenied`.
pub fn sys_thread_set_priority(thread_slot: u64, priority: u8) -> SysResult<u64> {
    decode(unsafe { syscall2(Sys::ThreadSetPriority, thread_slot, priority as u64) })
}

// === Endpoints and naming ===

/// Retype untyped memory into a fresh endpoint at `dest_slot`.
pub fn sys_endpoint_create(untyped_slot: u64, dest_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall2(Sys::EndpointCreate, untyped_slot, dest_slot) })
}

/// Destroy an endpoint; every queued thread wakes with `InvalidState`.
pub fn sys_endpoint_delete(endpoint_slot: u64) -> SysResult<u64> {
    decode(unsafe { syscall1(Sys::EndpointDelete, endpoint_slot) })
}

/// Register an endpoint under a UTF-8 name.
///
/// # Safety
///
/// `name` must point to `name_len` readable bytes for the duration of the
/// call.
pub unsafe fn sys_namespace_register(endpoint_slot: u64, name: *const u8, name_len: usize) -> SysResult<u64> {
    decode(unsafe { syscall3(Sys::NamespaceRegister, endpoint_slot, name as u64, name_len as u64) })
}

// === Debug ===

/// Write one byte to the kernel console.
pub fn sys_debug_putchar(c: u8) {
    unsafe {
        syscall1(Sys::DebugPutchar, c as u64);
    }
}

/// Write a string to the kernel console, one byte at a time.
pub fn sys_debug_print(s: &str) {
    for c in s.bytes() {
        sys_debug_putchar(c);
    }
}

/// Log the caller's occupied capability slots.
pub fn sys_debug_dump_caps() -> SysResult<u64> {
    decode(unsafe { syscall0(Sys::DebugDumpCaps) })
}
