//! Locks: binary semaphores with an owner and priority donation.
//!
//! A lock may be held by at most one thread and is not recursive.
//! Under the priority policy, acquiring a held lock donates the
//! waiter's effective priority to the holder, chasing the holder's
//! own wait chain for up to [`DONATE_MAX`] hops, so a high-priority
//! waiter is never stalled behind a preempted low-priority holder.
//! Donation is disabled under mlfqs.

use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::sched::thread::{self, Donation, Tcb};
use crate::sched::{scheduler, SchedPolicy, DONATE_MAX};
use crate::sync::Semaphore;

/// Shared lock state. Donation records and `wait_lock` back-references
/// identify a lock by this allocation.
pub(crate) struct LockShared {
    pub(crate) sema: Semaphore,
    pub(crate) owner: SpinMutex<Option<Arc<Tcb>>>,
}

/// A mutual-exclusion lock. Clones share the same lock.
#[derive(Clone)]
pub struct Lock {
    pub(crate) shared: Arc<LockShared>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LockShared {
                sema: Semaphore::new(1),
                owner: SpinMutex::new(None),
            }),
        }
    }

    /// Acquire the lock, sleeping until it is available. The lock must
    /// not already be held by the caller.
    ///
    /// May sleep, so it must not be called from an interrupt handler.
    pub fn acquire(&self) {
        let cur = thread::current();
        let kernel = cur.kernel();
        assert!(!kernel.intr.context());
        assert!(!self.held_by_current_thread(), "recursive lock acquire");

        if kernel.sched.policy == SchedPolicy::Priority {
            let old = kernel.intr.disable();
            cur.inner.lock().wait_lock = Some(self.shared.clone());
            donate_chain(&kernel, &cur);
            kernel.intr.set_level(old);
        }

        self.shared.sema.down();
        *self.shared.owner.lock() = Some(cur.clone());
        cur.inner.lock().wait_lock = None;
    }

    /// Acquire without sleeping; returns whether the lock was taken.
    /// Safe from an interrupt handler; performs no donation.
    pub fn try_acquire(&self) -> bool {
        assert!(!self.held_by_current_thread(), "recursive lock acquire");
        let success = self.shared.sema.try_down();
        if success {
            *self.shared.owner.lock() = Some(thread::current());
        }
        success
    }

    /// Release the lock, which must be held by the caller. Donations
    /// received through this lock are withdrawn before the next holder
    /// is woken.
    pub fn release(&self) {
        let cur = thread::current();
        let kernel = cur.kernel();
        assert!(self.held_by_current_thread(), "releasing a lock not held");

        if kernel.sched.policy == SchedPolicy::Priority {
            let old = kernel.intr.disable();
            {
                let mut state = kernel.sched.state.lock();
                let mut inner = cur.inner.lock();
                inner
                    .donations
                    .retain(|d| !Arc::ptr_eq(&d.lock, &self.shared));
                let donated = inner.donations.iter().map(|d| d.priority).max();
                drop(inner);

                let effective = donated.map_or(cur.base_priority(), |d| d.max(cur.base_priority()));
                if effective != cur.priority() {
                    scheduler::priority_changed(&mut state, &cur, effective);
                }
            }
            kernel.intr.set_level(old);
        }

        *self.shared.owner.lock() = None;
        self.shared.sema.up();
    }

    /// Whether the calling thread holds this lock. (Asking about some
    /// other thread would be racy.)
    pub fn held_by_current_thread(&self) -> bool {
        match thread::try_current() {
            Some(cur) => self
                .shared
                .owner
                .lock()
                .as_ref()
                .is_some_and(|o| Arc::ptr_eq(o, &cur)),
            None => false,
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the wait chain from `donor`, boosting each holder whose base
/// priority is below the donor's effective priority. The walk is
/// bounded by [`DONATE_MAX`] hops and stops early if it closes a cycle
/// back onto the donor.
fn donate_chain(kernel: &Arc<crate::kernel::Kernel>, donor: &Arc<Tcb>) {
    let donor_priority = donor.priority();
    let mut state = kernel.sched.state.lock();

    let mut hop_lock = donor.inner.lock().wait_lock.clone();
    for _ in 0..DONATE_MAX {
        let lock = match hop_lock {
            Some(l) => l,
            None => break,
        };
        let holder = match lock.owner.lock().clone() {
            Some(h) => h,
            None => break,
        };
        if Arc::ptr_eq(&holder, donor) {
            break;
        }

        if holder.base_priority() < donor_priority {
            holder.inner.lock().donations.push(Donation {
                lock: lock.clone(),
                priority: donor_priority,
            });
            if holder.priority() < donor_priority {
                scheduler::priority_changed(&mut state, &holder, donor_priority);
            }
        }

        hop_lock = holder.inner.lock().wait_lock.clone();
    }
}
