//! Run queue
//!
//! A single global FIFO of Runnable threads, linked intrusively through
//! the TCB `next` field. Priority is stored in the TCB but advisory: the
//! scheduler always takes the queue head.
//!
//! # Invariants
//!
//! - Only Runnable threads appear on the queue, each at most once
//! - A queued thread's `next` link belongs to this queue and nothing else

use crate::thread::pool::TcbPool;
use crate::thread::{ThreadState, Tid, NO_THREAD};

/// FIFO run queue with head and tail.
pub struct RunQueue {
    head: Tid,
    tail: Tid,
    len: usize,
}

impl RunQueue {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: NO_THREAD,
            tail: NO_THREAD,
            len: 0,
        }
    }

    /// Number of queued threads.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if no thread is queued.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a Runnable thread at the tail.
    pub fn enqueue(&mut self, pool: &mut TcbPool, tid: Tid) {
        debug_assert!(!self.contains(pool, tid), "thread {tid} enqueued twice");
        {
            let tcb = pool.get_mut(tid).expect("enqueue of invalid tid");
            debug_assert_eq!(tcb.state, ThreadState::Runnable);
            tcb.next = NO_THREAD;
        }

        if self.tail == NO_THREAD {
            self.head = tid;
        } else if let Some(tail) = pool.get_mut(self.tail) {
            tail.next = tid;
        }
        self.tail = tid;
        self.len += 1;
    }

    /// Pop the head, or `None` when empty.
    pub fn dequeue(&mut self, pool: &mut TcbPool) -> Option<Tid> {
        let tid = self.head;
        if tid == NO_THREAD {
            return None;
        }
        let tcb = pool.get_mut(tid)?;
        self.head = tcb.next;
        tcb.next = NO_THREAD;
        if self.head == NO_THREAD {
            self.tail = NO_THREAD;
        }
        self.len -= 1;
        Some(tid)
    }

    /// Unlink a thread from anywhere in the queue.
    ///
    /// Needed when a Runnable thread is destroyed by revocation.
    pub fn remove(&mut self, pool: &mut TcbPool, tid: Tid) -> bool {
        let mut prev = NO_THREAD;
        let mut cur = self.head;
        while cur != NO_THREAD {
            let next = pool.get(cur).map(|t| t.next).unwrap_or(NO_THREAD);
            if cur == tid {
                if prev == NO_THREAD {
                    self.head = next;
                } else if let Some(p) = pool.get_mut(prev) {
                    p.next = next;
                }
                if self.tail == tid {
                    self.tail = prev;
                }
                if let Some(t) = pool.get_mut(tid) {
                    t.next = NO_THREAD;
                }
                self.len -= 1;
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    /// Check queue membership (O(n); tests and debug asserts).
    pub fn contains(&self, pool: &TcbPool, tid: Tid) -> bool {
        let mut cur = self.head;
        while cur != NO_THREAD {
            if cur == tid {
                return true;
            }
            cur = pool.get(cur).map(|t| t.next).unwrap_or(NO_THREAD);
        }
        false
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::pool::TcbPool;

    fn pool_with_runnable(n: usize) -> (TcbPool, Vec<Tid>) {
        let mut pool = crate::thread::pool::test_pool();
        let mut tids = Vec::new();
        for _ in 0..n {
            let tid = pool.alloc().unwrap();
            pool.get_mut(tid).unwrap().state = ThreadState::Runnable;
            tids.push(tid);
        }
        (pool, tids)
    }

    #[test]
    fn test_fifo_order() {
        let (mut pool, tids) = pool_with_runnable(3);
        let mut q = RunQueue::new();
        for &t in &tids {
            q.enqueue(&mut pool, t);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(&mut pool), Some(tids[0]));
        assert_eq!(q.dequeue(&mut pool), Some(tids[1]));
        assert_eq!(q.dequeue(&mut pool), Some(tids[2]));
        assert_eq!(q.dequeue(&mut pool), None);
    }

    #[test]
    fn test_membership_once() {
        let (mut pool, tids) = pool_with_runnable(2);
        let mut q = RunQueue::new();
        q.enqueue(&mut pool, tids[0]);
        q.enqueue(&mut pool, tids[1]);
        assert!(q.contains(&pool, tids[0]));

        // Dequeued thread is no longer a member.
        q.dequeue(&mut pool).unwrap();
        assert!(!q.contains(&pool, tids[0]));
        assert!(q.contains(&pool, tids[1]));
    }

    #[test]
    fn test_remove_middle_and_tail() {
        let (mut pool, tids) = pool_with_runnable(3);
        let mut q = RunQueue::new();
        for &t in &tids {
            q.enqueue(&mut pool, t);
        }

        assert!(q.remove(&mut pool, tids[1]));
        assert_eq!(q.len(), 2);
        assert!(!q.contains(&pool, tids[1]));

        assert!(q.remove(&mut pool, tids[2]));
        // Tail removal keeps the queue usable.
        pool.get_mut(tids[1]).unwrap().state = ThreadState::Runnable;
        q.enqueue(&mut pool, tids[1]);
        assert_eq!(q.dequeue(&mut pool), Some(tids[0]));
        assert_eq!(q.dequeue(&mut pool), Some(tids[1]));
        assert_eq!(q.dequeue(&mut pool), None);
    }

    #[test]
    fn test_remove_absent() {
        let (mut pool, tids) = pool_with_runnable(1);
        let mut q = RunQueue::new();
        assert!(!q.remove(&mut pool, tids[0]));
    }
}
