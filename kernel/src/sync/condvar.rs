//! Condition variables, Mesa style.
//!
//! Signaling and waking are not atomic, so waiters must re-check their
//! condition after `wait` returns. Each waiter carries a private
//! 0-initialized semaphore; `signal` wakes the queued waiter whose
//! thread has the highest effective priority even though the queue
//! itself is unordered. A condition variable belongs to a single lock
//! by convention only.

use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::sched::thread::{self, Tcb};
use crate::sync::{Lock, Semaphore};

struct CondWaiter {
    thread: Arc<Tcb>,
    sema: Semaphore,
}

/// A condition variable. Clones share the same wait queue.
#[derive(Clone)]
pub struct Condvar {
    waiters: Arc<SpinMutex<Vec<CondWaiter>>>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(SpinMutex::new(Vec::new())),
        }
    }

    /// Atomically release `lock` and wait to be signaled, then
    /// re-acquire `lock` before returning. The caller must hold
    /// `lock`; may sleep, so not callable from an interrupt handler.
    pub fn wait(&self, lock: &Lock) {
        let cur = thread::current();
        let kernel = cur.kernel();
        assert!(!kernel.intr.context());
        assert!(lock.held_by_current_thread(), "cond_wait without the lock");

        let sema = Semaphore::new(0);
        self.waiters.lock().push(CondWaiter {
            thread: cur,
            sema: sema.clone(),
        });
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wake the waiting thread with the highest effective priority, if
    /// any. The caller must hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        let cur = thread::current();
        assert!(!cur.kernel().intr.context());
        assert!(lock.held_by_current_thread(), "cond_signal without the lock");

        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let mut best = 0;
        for (i, w) in waiters.iter().enumerate() {
            if w.thread.priority() > waiters[best].thread.priority() {
                best = i;
            }
        }
        let woken = waiters.remove(best);
        drop(waiters);
        woken.sema.up();
    }

    /// Wake every waiting thread. The caller must hold `lock`.
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
