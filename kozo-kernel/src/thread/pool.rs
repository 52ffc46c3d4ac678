//! TCB pool
//!
//! A fixed array of [`MAX_THREADS`] TCBs with a free list threaded
//! through the `next` field. Allocation pops the head and free pushes it
//! back; both are a bounded handful of memory operations. The TID is the
//! TCB's index.

use spin::Mutex;

use super::{Tcb, ThreadState, Tid, MAX_THREADS, NO_THREAD};

/// The pool: TCB storage plus the free-list head.
pub struct TcbPool {
    tcbs: [Tcb; MAX_THREADS],
    free_head: Tid,
}

impl TcbPool {
    const fn new() -> Self {
        Self {
            tcbs: [Tcb::empty(); MAX_THREADS],
            free_head: NO_THREAD,
        }
    }

    /// Link every TCB into the free list.
    fn init(&mut self) {
        for i in 0..MAX_THREADS {
            self.tcbs[i].tid = i as Tid;
            self.tcbs[i].state = ThreadState::Free;
            self.tcbs[i].next = if i + 1 < MAX_THREADS {
                (i + 1) as Tid
            } else {
                NO_THREAD
            };
        }
        self.free_head = 0;
    }

    /// Pop a TCB off the free list. O(1).
    pub fn alloc(&mut self) -> Option<Tid> {
        let tid = self.free_head;
        if tid == NO_THREAD {
            return None;
        }
        let tcb = &mut self.tcbs[tid as usize];
        self.free_head = tcb.next;

        let keep_tid = tcb.tid;
        *tcb = Tcb::empty();
        tcb.tid = keep_tid;
        tcb.state = ThreadState::Suspended;
        Some(tid)
    }

    /// Push a TCB back on the free list. O(1).
    ///
    /// The caller must have removed the thread from every queue first.
    pub fn free(&mut self, tid: Tid) {
        let tcb = &mut self.tcbs[tid as usize];
        debug_assert!(
            tcb.state != ThreadState::Free,
            "double free of TCB {tid}"
        );
        tcb.state = ThreadState::Free;
        tcb.next = self.free_head;
        self.free_head = tid;
    }

    /// Access a TCB by TID.
    pub fn get(&self, tid: Tid) -> Option<&Tcb> {
        self.tcbs.get(tid as usize)
    }

    /// Access a TCB mutably by TID.
    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        self.tcbs.get_mut(tid as usize)
    }
}

static POOL: Mutex<TcbPool> = Mutex::new(TcbPool::new());

/// Initialise the pool free list. Call once at boot.
pub fn init() {
    POOL.lock().init();
    log::info!("TCB pool: {MAX_THREADS} threads");
}

/// Allocate a TCB; `None` when the pool is exhausted.
#[must_use]
pub fn alloc_tcb() -> Option<Tid> {
    POOL.lock().alloc()
}

/// Return a TCB to the pool.
pub fn free_tcb(tid: Tid) {
    POOL.lock().free(tid);
}

/// Run `f` with mutable access to one TCB.
pub fn with_tcb<R>(tid: Tid, f: impl FnOnce(&mut Tcb) -> R) -> Option<R> {
    let mut pool = POOL.lock();
    pool.get_mut(tid).map(f)
}

/// Run `f` with the whole pool. Needed by code that follows intrusive
/// links across TCBs (run queue, endpoint queues).
pub fn with_pool<R>(f: impl FnOnce(&mut TcbPool) -> R) -> R {
    f(&mut POOL.lock())
}

/// A detached, initialised pool for unit tests elsewhere in the kernel.
#[cfg(test)]
pub fn test_pool() -> TcbPool {
    let mut p = TcbPool::new();
    p.init();
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pool() -> TcbPool {
        test_pool()
    }

    #[test]
    fn test_alloc_distinct_tids() {
        let mut p = fresh_pool();
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(p.get(a).unwrap().state, ThreadState::Suspended);
    }

    #[test]
    fn test_free_is_lifo() {
        let mut p = fresh_pool();
        let a = p.alloc().unwrap();
        let _b = p.alloc().unwrap();
        p.free(a);
        assert_eq!(p.alloc(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut p = fresh_pool();
        for _ in 0..MAX_THREADS {
            assert!(p.alloc().is_some());
        }
        assert_eq!(p.alloc(), None);

        // Freeing any TCB makes allocation possible again.
        p.free(17);
        assert_eq!(p.alloc(), Some(17));
    }

    #[test]
    fn test_alloc_resets_fields() {
        let mut p = fresh_pool();
        let a = p.alloc().unwrap();
        p.get_mut(a).unwrap().ipc_badge = 0xDEAD;
        p.get_mut(a).unwrap().is_call = true;
        p.free(a);
        let again = p.alloc().unwrap();
        assert_eq!(again, a);
        assert_eq!(p.get(a).unwrap().ipc_badge, 0);
        assert!(!p.get(a).unwrap().is_call);
    }
}
