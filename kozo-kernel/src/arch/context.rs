//! Context switch primitives
//!
//! The kernel switches threads by swapping kernel stacks: the callee-saved
//! registers go onto the outgoing thread's stack, its RSP is stored in
//! the TCB, and the incoming thread's RSP is loaded and unwound the same
//! way. Everything else (the user-register frame) already lives on the
//! thread's kernel stack, saved by the syscall or interrupt entry.
//!
//! A thread that has never run unwinds into one of the entry thunks
//! instead, which drops it into its entry point through a privilege
//! return; [`setup_thread`](crate::thread::setup_thread) builds the
//! matching stack frame.

use core::arch::global_asm;

global_asm!(
    r#"
// context_switch(save_rsp: *mut u64 [rdi], next_rsp: u64 [rsi])
//
// Saves the callee-saved register set and the stack pointer of the
// current thread, then resumes the next thread from its saved stack.
// Returns (into the *next* thread's frame) with all callee-saved
// registers restored.
.global context_switch
context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// First-entry thunk for user threads: scrub every general-purpose
// register, swap to the user GS base, and drop to ring 3 through the
// privilege-return frame left on the stack.
.global thread_entry_thunk_user
thread_entry_thunk_user:
    xor eax, eax
    xor ebx, ebx
    xor ecx, ecx
    xor edx, edx
    xor esi, esi
    xor edi, edi
    xor ebp, ebp
    xor r8d, r8d
    xor r9d, r9d
    xor r10d, r10d
    xor r11d, r11d
    xor r12d, r12d
    xor r13d, r13d
    xor r14d, r14d
    xor r15d, r15d
    swapgs
    iretq

// First-entry thunk for kernel threads: no GS swap, no scrubbing needed.
.global thread_entry_thunk_kernel
thread_entry_thunk_kernel:
    iretq
"#
);

extern "C" {
    /// Swap kernel stacks; see the assembly above.
    ///
    /// # Safety
    ///
    /// `save_rsp` must point into a live TCB, `next_rsp` must be a stack
    /// produced by a previous switch or by `setup_thread`, and interrupts
    /// must be disabled across the call.
    pub fn context_switch(save_rsp: *mut u64, next_rsp: u64);

    /// First-entry path for user threads.
    pub fn thread_entry_thunk_user();

    /// First-entry path for kernel threads.
    pub fn thread_entry_thunk_kernel();
}
