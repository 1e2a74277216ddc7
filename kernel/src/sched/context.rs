//! Low-level context switch for the hosted kernel.
//!
//! Each kernel thread is backed by one OS thread parked on a private
//! [`Gate`]. "Switching" to a thread means depositing a run token in its
//! gate; the outgoing thread then parks until its own token reappears.
//! At most one token is in flight, so at most one kernel thread executes
//! at a time, which is what lets interrupt masking stand in for all
//! other atomicity the way it does on a single CPU.

use std::sync::{Condvar, Mutex};

/// A one-token gate: a binary hand-off between scheduler and thread.
pub struct Gate {
    token: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Deposit the run token, unparking the owning thread.
    pub fn open(&self) {
        let mut token = self.token.lock().unwrap();
        debug_assert!(!*token, "double switch to the same thread");
        *token = true;
        self.cond.notify_one();
    }

    /// Park until the run token arrives, then consume it.
    ///
    /// The token model has no lost wakeups: an `open` that races ahead
    /// of the `wait` is observed on entry.
    pub fn wait(&self) {
        let mut token = self.token.lock().unwrap();
        while !*token {
            token = self.cond.wait(token).unwrap();
        }
        *token = false;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_open_before_wait_is_not_lost() {
        let gate = Gate::new();
        gate.open();
        gate.wait();
    }

    #[test]
    fn test_hand_off_across_threads() {
        let gate = Arc::new(Gate::new());
        let g = gate.clone();
        let handle = std::thread::spawn(move || {
            g.wait();
            42
        });
        gate.open();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
