//! Scheduler
//!
//! Single processor, preemptive, one kernel stack per thread. A global
//! FIFO [`RunQueue`] holds every Runnable thread; the idle thread
//! (priority 255) cycles through it like any other, so there is always a
//! next thread to pick.
//!
//! The scheduler owns the "current thread" slot. Capability, IPC, and
//! VMM code suspend a thread only by calling [`block`] or [`yield_now`];
//! nothing else switches execution. All of this runs with interrupts
//! disabled — kernel code is never preempted, so the queue and pool need
//! no finer locking than their mutexes.

pub mod idle;
mod run_queue;

pub use run_queue::RunQueue;

use spin::Mutex;

use crate::arch;
use crate::memory::paging;
use crate::thread::pool;
use crate::thread::{ThreadState, Tid, NO_THREAD};

/// Priority of the idle thread: the bottom of the advisory range.
pub const IDLE_PRIORITY: u8 = 255;

struct Scheduler {
    queue: RunQueue,
    current: Tid,
    idle: Tid,
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
    queue: RunQueue::new(),
    current: NO_THREAD,
    idle: NO_THREAD,
});

/// Register the boot context as the idle thread and make it current.
///
/// The boot stack becomes the idle thread's kernel stack; its TCB never
/// enters user mode, so it carries no user frame.
pub fn init(idle_tid: Tid) {
    pool::with_tcb(idle_tid, |tcb| {
        tcb.state = ThreadState::Running;
        tcb.priority = IDLE_PRIORITY;
        tcb.set_name(b"idle");
    });
    let mut sched = SCHEDULER.lock();
    sched.current = idle_tid;
    sched.idle = idle_tid;
    log::info!("scheduler: idle thread is tid {idle_tid}");
}

/// TID of the currently running thread.
#[must_use]
pub fn current() -> Tid {
    SCHEDULER.lock().current
}

/// Put a Runnable thread on the run queue.
pub fn enqueue(tid: Tid) {
    let mut sched = SCHEDULER.lock();
    pool::with_pool(|p| sched.queue.enqueue(p, tid));
}

/// Make a blocked or suspended thread Runnable and queue it.
pub fn unblock(tid: Tid) {
    let mut sched = SCHEDULER.lock();
    pool::with_pool(|p| {
        if let Some(tcb) = p.get_mut(tid) {
            tcb.state = ThreadState::Runnable;
        }
        sched.queue.enqueue(p, tid);
    });
}

/// Remove a thread from scheduling (revocation, fault kill).
///
/// Returns `false` for the running thread, which cannot be removed from
/// underneath itself.
pub fn remove_thread(tid: Tid) -> bool {
    let mut sched = SCHEDULER.lock();
    if sched.current == tid {
        return false;
    }
    pool::with_pool(|p| {
        sched.queue.remove(p, tid);
    });
    true
}

/// Yield the processor: requeue the caller if it is still Runnable, pick
/// the queue head, switch.
pub fn yield_now() {
    reschedule(true);
}

/// Block the caller in `state` and switch away. The caller must already
/// be threaded onto whatever queue will wake it.
pub fn block(state: ThreadState) {
    debug_assert!(state != ThreadState::Runnable && state != ThreadState::Running);
    {
        let sched = SCHEDULER.lock();
        let cur = sched.current;
        pool::with_tcb(cur, |tcb| tcb.state = state);
    }
    reschedule(false);
}

/// Timer-driven preemption: identical to a yield.
pub fn preempt() {
    reschedule(true);
}

/// Direct switch to `next`, bypassing the queue (IPC fast path).
///
/// The caller must have already fixed both threads' states: the target
/// Runnable (or freshly woken) and the current thread in its blocked or
/// requeued state. The target is made Running here.
pub fn switch_to(next: Tid) {
    switch_from_current(next);
}

/// Pick the next thread and switch to it.
fn reschedule(requeue_current: bool) {
    let next = {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;

        pool::with_pool(|p| {
            if requeue_current {
                let still_running = p
                    .get_mut(cur)
                    .map(|tcb| {
                        if tcb.state == ThreadState::Running {
                            tcb.state = ThreadState::Runnable;
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);
                if still_running {
                    sched.queue.enqueue(p, cur);
                }
            }
            sched.queue.dequeue(p)
        })
    };

    match next {
        Some(next) => switch_from_current(next),
        // Nothing runnable anywhere: only possible if the current thread
        // blocked itself with an empty queue, which the always-queued
        // idle thread rules out.
        None => panic!("run queue empty and current thread not runnable"),
    }
}

/// The common tail of every switch: update the current slot, the per-CPU
/// kernel stack, and CR3, then swap kernel stacks.
fn switch_from_current(next: Tid) {
    let (cur_rsp_ptr, next_rsp, next_stack_top, next_space) = {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        if cur == next {
            pool::with_tcb(cur, |tcb| tcb.state = ThreadState::Running);
            return;
        }
        sched.current = next;

        pool::with_pool(|p| {
            let next_tcb = p.get_mut(next).expect("switch to invalid tid");
            next_tcb.state = ThreadState::Running;
            let next_rsp = next_tcb.saved_stack_ptr;
            let next_stack_top = next_tcb.kernel_stack_top;
            let next_space = next_tcb.address_space;

            let cur_tcb = p.get_mut(cur).expect("switch from invalid tid");
            let cur_rsp_ptr = &mut cur_tcb.saved_stack_ptr as *mut u64;
            (cur_rsp_ptr, next_rsp, next_stack_top, next_space)
        })
    };

    // The next thread's syscalls and ring transitions must land on its
    // own kernel stack. The idle thread keeps the boot stack and never
    // enters user mode, so its zero stack-top is skipped.
    if !next_stack_top.is_null() {
        arch::set_kernel_stack(next_stack_top);
    }
    if !next_space.is_null() {
        paging::switch_address_space(next_space);
    }

    // SAFETY: Both pointers refer to live TCBs; locks are released, and
    // interrupts are off, so nobody observes the half-switched state.
    // After the switch returns, this thread is Running again.
    unsafe {
        arch::context::context_switch(cur_rsp_ptr, next_rsp);
    }
}
