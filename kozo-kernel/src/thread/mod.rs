//! Thread control blocks
//!
//! A thread is a TCB from the fixed [`pool`], a kernel stack, an address
//! space, and a capability root. The TCB's `next` field threads it into
//! exactly one intrusive list at a time: the pool free list, the run
//! queue, or an endpoint wait queue.
//!
//! # Saved contexts
//!
//! A thread that entered the kernel through the fast-syscall path has its
//! user registers saved in a [`SyscallFrame`](crate::arch::SyscallFrame)
//! at a fixed offset below its kernel stack top; IPC delivers message
//! words by writing that frame. A thread switched out in kernel mode
//! additionally has its callee-saved registers on its kernel stack at
//! `saved_stack_ptr`.

pub mod pool;

use core::cell::UnsafeCell;

use kozo_cap::CNodeId;
use kozo_common::{PhysAddr, VirtAddr};
use kozo_syscall::IPC_SCRATCH_SIZE;

use crate::arch::context::{thread_entry_thunk_kernel, thread_entry_thunk_user};
use crate::arch::gdt;
use crate::arch::SyscallFrame;

/// Thread identifier: the TCB's index in the pool.
pub type Tid = u16;

/// Sentinel for "no thread" in intrusive lists.
pub const NO_THREAD: Tid = u16::MAX;

/// Sentinel for "not queued on any endpoint".
pub const NO_ENDPOINT: u16 = u16::MAX;

/// Number of TCBs in the fixed pool.
pub const MAX_THREADS: usize = 256;

/// Bytes of kernel stack per thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Thread lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// On the pool free list.
    #[default]
    Free = 0,
    /// Created but not yet resumed, or explicitly suspended.
    Suspended = 1,
    /// On the run queue, ready to execute.
    Runnable = 2,
    /// Currently executing. Exactly one thread per processor.
    Running = 3,
    /// Off the run queue for a non-IPC reason (killed by a fault).
    Blocked = 4,
    /// Queued on an endpoint's send queue.
    BlockedSend = 5,
    /// Queued on an endpoint's receive queue.
    BlockedRecv = 6,
    /// Waiting for a server's reply after a Call.
    BlockedReply = 7,
}

impl ThreadState {
    /// Check if the thread is waiting on IPC.
    #[inline]
    #[must_use]
    pub const fn is_ipc_blocked(self) -> bool {
        matches!(
            self,
            Self::BlockedSend | Self::BlockedRecv | Self::BlockedReply
        )
    }

    /// Check if the thread may be placed on the run queue.
    #[inline]
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Runnable)
    }
}

/// Thread control block.
#[derive(Clone, Copy)]
pub struct Tcb {
    /// Pool index of this TCB.
    pub tid: Tid,
    /// Lifecycle state.
    pub state: ThreadState,
    /// Scheduling priority (advisory; 255 is reserved for idle).
    pub priority: u8,
    /// Top of this thread's kernel stack.
    pub kernel_stack_top: VirtAddr,
    /// Kernel RSP while the thread is switched out.
    pub saved_stack_ptr: u64,
    /// Root page table (CR3). Null for kernel-only threads.
    pub address_space: PhysAddr,
    /// Root CNode of this thread's capability space.
    pub cap_root: CNodeId,
    /// Intrusive link: free list, run queue, or endpoint queue.
    pub next: Tid,
    /// Endpoint this thread is queued on, or [`NO_ENDPOINT`].
    pub blocked_on: u16,
    /// Set while a blocked send is the first half of a Call.
    pub is_call: bool,
    /// Message words stashed while queued on an endpoint.
    pub ipc_msg: [u64; 3],
    /// Badge stashed while queued on an endpoint.
    pub ipc_badge: u64,
    /// Per-thread buffer for message payloads beyond the register words.
    pub ipc_scratch: [u8; IPC_SCRATCH_SIZE],
    /// Debug name.
    pub name: [u8; 16],
}

impl Tcb {
    /// A free, unlinked TCB.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            tid: 0,
            state: ThreadState::Free,
            priority: 128,
            kernel_stack_top: VirtAddr::new(0),
            saved_stack_ptr: 0,
            address_space: PhysAddr::new(0),
            cap_root: CNodeId::new(0),
            next: NO_THREAD,
            blocked_on: NO_ENDPOINT,
            is_call: false,
            ipc_msg: [0; 3],
            ipc_badge: 0,
            ipc_scratch: [0; IPC_SCRATCH_SIZE],
            name: [0; 16],
        }
    }

    /// Pointer to this thread's saved user-register frame.
    ///
    /// Valid only while the thread is inside the kernel via the syscall
    /// path (which is the case for every IPC-blocked thread).
    #[must_use]
    pub fn trap_frame(&self) -> *mut SyscallFrame {
        (self.kernel_stack_top.as_u64() as usize - core::mem::size_of::<SyscallFrame>())
            as *mut SyscallFrame
    }

    /// Set the debug name.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(self.name.len());
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
    }
}

// -- Kernel stacks

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

struct StackPool(UnsafeCell<[KernelStack; MAX_THREADS]>);

// SAFETY: Each stack is used by exactly one thread; the pool hands a
// stack out only while its TCB is allocated.
unsafe impl Sync for StackPool {}

static STACKS: StackPool = StackPool(UnsafeCell::new(
    [KernelStack([0; KERNEL_STACK_SIZE]); MAX_THREADS],
));

/// Top of the kernel stack belonging to `tid`.
#[must_use]
pub fn kernel_stack_top(tid: Tid) -> VirtAddr {
    let base = STACKS.0.get() as u64;
    VirtAddr::new(base + ((tid as u64) + 1) * KERNEL_STACK_SIZE as u64)
}

/// Prepare a thread to run for the first time.
///
/// Builds the synthetic kernel-stack frame the context switch expects,
/// so the next switch to this thread "returns" into it as if it had just
/// been interrupted at `entry`:
///
/// ```text
/// high | SS  RSP  RFLAGS  CS  RIP      privilege-return record
///      | thunk address                 popped by `ret`
/// low  | rbp rbx r12 r13 r14 r15      zeroed callee-saved registers
/// ```
///
/// RFLAGS has interrupts enabled so the thread is preemptible from its
/// first instruction.
pub fn setup_thread(tcb: &mut Tcb, entry: VirtAddr, user_sp: VirtAddr, user_mode: bool) {
    let stack_top = kernel_stack_top(tcb.tid);
    tcb.kernel_stack_top = stack_top;

    let (cs, ss) = if user_mode {
        (gdt::user_code_selector(), gdt::user_data_selector())
    } else {
        (gdt::kernel_code_selector(), gdt::kernel_data_selector())
    };
    let thunk = if user_mode {
        thread_entry_thunk_user as usize as u64
    } else {
        thread_entry_thunk_kernel as usize as u64
    };

    const IF: u64 = 1 << 9;
    let frame: [u64; 12] = [
        0, // r15
        0, // r14
        0, // r13
        0, // r12
        0, // rbx
        0, // rbp
        thunk,
        entry.as_u64(),
        cs as u64,
        IF | 0x2, // RFLAGS: interrupts on, reserved bit set
        user_sp.as_u64(),
        ss as u64,
    ];

    let sp = stack_top.as_u64() - (frame.len() * 8) as u64;
    // SAFETY: The stack belongs exclusively to this TCB and the thread is
    // not running.
    unsafe {
        core::ptr::copy_nonoverlapping(frame.as_ptr(), sp as *mut u64, frame.len());
    }
    tcb.saved_stack_ptr = sp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_tops_disjoint() {
        let a = kernel_stack_top(0).as_u64();
        let b = kernel_stack_top(1).as_u64();
        assert_eq!(b - a, KERNEL_STACK_SIZE as u64);
    }

    #[test]
    fn test_trap_frame_below_stack_top() {
        let mut tcb = Tcb::empty();
        tcb.tid = 3;
        tcb.kernel_stack_top = kernel_stack_top(3);
        let frame = tcb.trap_frame() as u64;
        assert_eq!(
            frame + core::mem::size_of::<SyscallFrame>() as u64,
            tcb.kernel_stack_top.as_u64()
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(ThreadState::BlockedSend.is_ipc_blocked());
        assert!(ThreadState::BlockedReply.is_ipc_blocked());
        assert!(!ThreadState::Runnable.is_ipc_blocked());
        assert!(ThreadState::Runnable.is_runnable());
        assert!(!ThreadState::Running.is_runnable());
    }
}
