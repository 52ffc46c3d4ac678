//! Architecture layer (x86-64)
//!
//! Everything that touches descriptor tables, MSRs, the interrupt
//! controller, or raw register state lives under this module. The rest
//! of the kernel sees a small safe surface: [`SyscallFrame`],
//! [`set_kernel_stack`], and the init entry points.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod lapic;
pub mod serial;
pub mod syscall_entry;

pub use syscall_entry::SyscallFrame;

use kozo_common::VirtAddr;

/// Point ring transitions and syscalls at a thread's kernel stack.
///
/// Updates both the TSS RSP0 (interrupts from user mode) and the per-CPU
/// block the fast-syscall entry reads.
pub fn set_kernel_stack(top: VirtAddr) {
    gdt::set_tss_rsp0(top);
    syscall_entry::set_kernel_stack_top(top);
}
