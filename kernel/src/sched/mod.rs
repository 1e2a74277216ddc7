//! Thread scheduler.
//!
//! Two mutually exclusive policies, selected at boot: strict priority
//! scheduling with priority donation (the default), and a 4.4BSD-style
//! multi-level feedback queue (`-o mlfqs`) driven by `recent_cpu`,
//! `nice`, and the system load average in Q17.14 fixed point.

pub mod context;
pub mod queue;
pub mod scheduler;
pub mod thread;

pub use thread::{Tcb, Tid, TID_ERROR};

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Timer ticks each thread gets before preemption.
pub const TIME_SLICE: u32 = 4;

/// Maximum hops of the priority-donation chain walk.
pub const DONATE_MAX: usize = 8;

/// Ticks between mlfqs priority recomputations.
pub const PRIORITY_UPDATE_FREQ: i64 = 4;

/// States in a thread's life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Running thread. Exactly one thread is in this state.
    Running,
    /// Not running but ready to run.
    Ready,
    /// Waiting for an event to trigger.
    Blocked,
    /// About to be destroyed.
    Dying,
}

/// Scheduling policy, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Strict priority scheduling with priority donation.
    #[default]
    Priority,
    /// 4.4BSD multi-level feedback queue; donation is disabled.
    Mlfqs,
}
