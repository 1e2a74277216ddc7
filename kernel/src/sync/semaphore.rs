//! Counting semaphores.
//!
//! A semaphore is a nonnegative integer with two atomic operators:
//! down ("P") waits for the value to become positive then decrements
//! it; up ("V") increments it and wakes one waiter, if any. Wakeup is
//! priority-ordered: up selects the waiter with the highest effective
//! priority, ties broken by arrival.

use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::sched::scheduler;
use crate::sched::thread::{self, Tcb};

struct SemaState {
    value: usize,
    waiters: Vec<Arc<Tcb>>,
}

/// A counting semaphore. Clones share the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<SpinMutex<SemaState>>,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self {
            state: Arc::new(SpinMutex::new(SemaState {
                value,
                waiters: Vec::new(),
            })),
        }
    }

    /// Down or "P": wait for the value to become positive, then
    /// decrement it.
    ///
    /// May sleep, so it must not be called from an interrupt handler.
    /// It may be called with interrupts disabled; if it sleeps, the
    /// next scheduled thread will typically re-enable them.
    pub fn down(&self) {
        let cur = thread::current();
        let kernel = cur.kernel();
        assert!(!kernel.intr.context());

        let old = kernel.intr.disable();
        loop {
            let mut state = self.state.lock();
            if state.value > 0 {
                state.value -= 1;
                break;
            }
            state.waiters.push(cur.clone());
            drop(state);
            thread::block();
        }
        kernel.intr.set_level(old);
    }

    /// Down only if the value is already positive; never sleeps, so it
    /// is safe from an interrupt handler. Returns whether the value
    /// was decremented.
    pub fn try_down(&self) -> bool {
        let cur = thread::current();
        let kernel = cur.kernel();

        let old = kernel.intr.disable();
        let mut state = self.state.lock();
        let success = state.value > 0;
        if success {
            state.value -= 1;
        }
        drop(state);
        kernel.intr.set_level(old);
        success
    }

    /// Up or "V": increment the value and wake the highest-priority
    /// waiter, if any. Safe from an interrupt handler.
    pub fn up(&self) {
        let cur = thread::current();
        let kernel = cur.kernel();

        let old = kernel.intr.disable();
        {
            let mut state = self.state.lock();
            if !state.waiters.is_empty() {
                // First of the maxima keeps ties in arrival order.
                let mut best = 0;
                for (i, t) in state.waiters.iter().enumerate() {
                    if t.priority() > state.waiters[best].priority() {
                        best = i;
                    }
                }
                let woken = state.waiters.remove(best);
                thread::unblock(&woken);
            }
            state.value += 1;
        }
        scheduler::try_yield(&kernel);
        kernel.intr.set_level(old);
    }

    /// Current value, for diagnostics and tests.
    pub fn value(&self) -> usize {
        self.state.lock().value
    }
}
