//! Fast-syscall entry
//!
//! Programs the `syscall`/`sysretq` MSRs and provides the assembly entry
//! stub. The stub swaps to the current thread's kernel stack (published
//! in the per-CPU block by the scheduler), saves the caller's registers
//! as a [`SyscallFrame`] at a fixed offset below the stack top, and calls
//! the dispatcher. On the way out it loads the scratch registers from the
//! frame — which the dispatcher has either scrubbed to zero or filled
//! with the documented return payload — and returns to user mode.

use core::arch::global_asm;
use core::cell::UnsafeCell;

use kozo_common::VirtAddr;
use x86_64::registers::model_specific::{Efer, EferFlags, KernelGsBase, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;

/// Saved user registers, as laid down by the entry stub.
///
/// Lives at `kernel_stack_top - size_of::<SyscallFrame>()` for every
/// thread currently inside the kernel via the syscall path; IPC writes a
/// blocked peer's wake-up registers here.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SyscallFrame {
    /// Operation number in; return value out.
    pub rax: u64,
    /// Argument 0 / wake-up badge.
    pub rdi: u64,
    /// Argument 1 / message word 0.
    pub rsi: u64,
    /// Argument 2 / message word 1.
    pub rdx: u64,
    /// Argument 3 / message word 2.
    pub r10: u64,
    /// Argument 4 / waking caller's TID.
    pub r8: u64,
    /// Argument 5.
    pub r9: u64,
    /// User RIP (saved by the CPU in `rcx`).
    pub rcx: u64,
    /// User RFLAGS (saved by the CPU in `r11`).
    pub r11: u64,
    /// User stack pointer.
    pub rsp: u64,
}

const _: () = assert!(core::mem::size_of::<SyscallFrame>() == 80);

impl SyscallFrame {
    /// Zero every scratch register that is not part of the return
    /// contract. `rcx`/`r11`/`rsp` survive (they restore RIP, RFLAGS and
    /// the stack); `rax` is written separately with the return value.
    pub fn scrub(&mut self) {
        self.rdi = 0;
        self.rsi = 0;
        self.rdx = 0;
        self.r10 = 0;
        self.r8 = 0;
        self.r9 = 0;
    }
}

/// Per-CPU block read by the entry stub via GS.
///
/// Offset 0: kernel stack top of the current thread.
/// Offset 8: scratch slot for the user RSP during entry.
#[repr(C)]
struct PerCpu {
    kernel_stack_top: u64,
    user_rsp: u64,
}

struct PerCpuCell(UnsafeCell<PerCpu>);
// SAFETY: Single processor; mutated with interrupts disabled.
unsafe impl Sync for PerCpuCell {}

static PER_CPU: PerCpuCell = PerCpuCell(UnsafeCell::new(PerCpu {
    kernel_stack_top: 0,
    user_rsp: 0,
}));

/// Publish the current thread's kernel stack top for the entry stub.
pub fn set_kernel_stack_top(top: VirtAddr) {
    // SAFETY: Single processor, interrupts disabled in kernel mode.
    unsafe {
        (*PER_CPU.0.get()).kernel_stack_top = top.as_u64();
    }
}

global_asm!(
    r#"
// Fast-syscall entry. On entry: rcx = user RIP, r11 = user RFLAGS,
// interrupts masked by SFMASK, still on the user stack.
.global syscall_entry_stub
syscall_entry_stub:
    swapgs
    mov gs:[8], rsp
    mov rsp, gs:[0]
    sub rsp, 80
    mov [rsp + 0], rax
    mov [rsp + 8], rdi
    mov [rsp + 16], rsi
    mov [rsp + 24], rdx
    mov [rsp + 32], r10
    mov [rsp + 40], r8
    mov [rsp + 48], r9
    mov [rsp + 56], rcx
    mov [rsp + 64], r11
    mov rax, gs:[8]
    mov [rsp + 72], rax
    mov rdi, rsp
    call syscall_dispatch
    mov rax, [rsp + 0]
    mov rdi, [rsp + 8]
    mov rsi, [rsp + 16]
    mov rdx, [rsp + 24]
    mov r10, [rsp + 32]
    mov r8,  [rsp + 40]
    mov r9,  [rsp + 48]
    mov rcx, [rsp + 56]
    mov r11, [rsp + 64]
    mov rsp, [rsp + 72]
    swapgs
    sysretq
"#
);

extern "C" {
    fn syscall_entry_stub();
}

/// Program the fast-syscall machinery.
///
/// # Safety
///
/// Must run once, after the GDT is loaded, before any thread reaches
/// user mode.
pub unsafe fn init() {
    let (user_code, user_data, kernel_code, kernel_data) = super::gdt::star_selectors();

    // SAFETY: MSR writes with selectors matching the GDT layout; the
    // entry stub upholds the syscall ABI.
    unsafe {
        Efer::update(|f| f.insert(EferFlags::SYSTEM_CALL_EXTENSIONS | EferFlags::NO_EXECUTE_ENABLE));
        Star::write(user_code, user_data, kernel_code, kernel_data)
            .expect("GDT layout violates the STAR selector contract");
        LStar::write(x86_64::VirtAddr::new(syscall_entry_stub as usize as u64));
        // Mask IF (kernel runs preemption-off), plus TF and DF for a
        // well-defined entry state.
        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG | RFlags::DIRECTION_FLAG);
        KernelGsBase::write(x86_64::VirtAddr::new(0));
        x86_64::registers::model_specific::GsBase::write(x86_64::VirtAddr::new(
            PER_CPU.0.get() as u64,
        ));
    }

    log::info!("fast-syscall entry installed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 80);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rax), 0);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rdi), 8);
        assert_eq!(core::mem::offset_of!(SyscallFrame, r10), 32);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rsp), 72);
    }

    #[test]
    fn test_scrub_keeps_return_path() {
        let mut f = SyscallFrame {
            rax: 1,
            rdi: 2,
            rsi: 3,
            rdx: 4,
            r10: 5,
            r8: 6,
            r9: 7,
            rcx: 8,
            r11: 9,
            rsp: 10,
        };
        f.scrub();
        assert_eq!(f.rdi | f.rsi | f.rdx | f.r10 | f.r8 | f.r9, 0);
        // RIP, RFLAGS, stack and the return value survive scrubbing.
        assert_eq!(f.rcx, 8);
        assert_eq!(f.r11, 9);
        assert_eq!(f.rsp, 10);
        assert_eq!(f.rax, 1);
    }
}
