//! Core scheduling: the dispatch loop, preemption checks, the timer
//! tick bookkeeping, and the mlfqs recomputations.
//!
//! `schedule` runs on the outgoing thread with interrupts disabled and
//! the outgoing state already changed away from RUNNING; it picks the
//! next thread (highest-priority ready, falling back to the idle
//! thread), hands over the CPU, and the incoming thread finishes the
//! switch in `schedule_tail`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use spin::{Mutex as SpinMutex, MutexGuard};

use super::queue::ReadyQueue;
use super::thread::{self, Tcb, Tid};
use super::{SchedPolicy, ThreadState, PRI_MAX, PRI_MIN, PRIORITY_UPDATE_FREQ, TIME_SLICE};
use crate::fixed_point::Fixed;
use crate::intr::IntrLevel;
use crate::kernel::Kernel;
use crate::timer::TIMER_FREQ;

/// Scheduler state guarded by interrupt masking, plus a spin mutex
/// for Rust's benefit. Only one kernel thread runs at a time, so the
/// mutex never contends.
pub(crate) struct SchedState {
    pub ready: ReadyQueue,
    /// Every live thread.
    pub all: Vec<Arc<Tcb>>,
    /// Non-idle threads that are READY or RUNNING; feeds load_avg.
    pub ready_threads: i32,
    /// Ticks since the running thread was dispatched.
    pub thread_ticks: u32,
    /// The thread we most recently switched away from; consumed by
    /// `schedule_tail` to reap DYING threads.
    pub prev: Option<Arc<Tcb>>,
    /// Tick statistics by class.
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
    /// Last tick at which mlfqs priorities were recomputed.
    pub last_priority_update: i64,
}

/// Per-kernel scheduler.
pub struct Scheduler {
    pub(crate) policy: SchedPolicy,
    pub(crate) state: SpinMutex<SchedState>,
    idle: OnceLock<Arc<Tcb>>,
    boot: OnceLock<Arc<Tcb>>,
    /// System load average, raw Q17.14 bits. Mlfqs only.
    load_avg: AtomicI32,
    next_tid: AtomicI32,
}

impl Scheduler {
    pub(crate) fn new(policy: SchedPolicy) -> Self {
        Self {
            policy,
            state: SpinMutex::new(SchedState {
                ready: ReadyQueue::new(policy),
                all: Vec::new(),
                ready_threads: 0,
                thread_ticks: 0,
                prev: None,
                idle_ticks: 0,
                kernel_ticks: 0,
                user_ticks: 0,
                last_priority_update: 0,
            }),
            idle: OnceLock::new(),
            boot: OnceLock::new(),
            load_avg: AtomicI32::new(0),
            next_tid: AtomicI32::new(1),
        }
    }

    pub(crate) fn allocate_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn set_idle(&self, t: Arc<Tcb>) {
        self.idle.set(t).ok().expect("idle thread already set");
    }

    pub(crate) fn set_boot(&self, t: Arc<Tcb>) {
        self.boot.set(t).ok().expect("boot thread already set");
    }

    pub(crate) fn is_idle(&self, t: &Arc<Tcb>) -> bool {
        self.idle.get().is_some_and(|i| Arc::ptr_eq(i, t))
    }

    pub(crate) fn is_boot(&self, t: &Arc<Tcb>) -> bool {
        self.boot.get().is_some_and(|b| Arc::ptr_eq(b, t))
    }

    pub(crate) fn load_avg(&self) -> Fixed {
        Fixed::from_raw(self.load_avg.load(Ordering::Acquire))
    }

    fn set_load_avg(&self, value: Fixed) {
        self.load_avg.store(value.raw(), Ordering::Release);
    }
}

/// Pick the next thread to run: front of the ready structure, or the
/// idle thread when nothing is ready.
fn next_thread_to_run(kernel: &Arc<Kernel>, state: &mut SchedState) -> Arc<Tcb> {
    state
        .ready
        .pop()
        .unwrap_or_else(|| kernel.sched.idle.get().expect("idle thread missing").clone())
}

/// Switch away from `cur`, whose state must already differ from
/// RUNNING. Interrupts must be off. Consumes the state guard: the
/// hand-off happens with no kernel locks held.
///
/// For a DYING thread this returns without re-parking; the caller
/// unwinds the backing OS thread.
pub(crate) fn schedule(kernel: &Arc<Kernel>, mut state: MutexGuard<'_, SchedState>, cur: &Arc<Tcb>) {
    assert_eq!(kernel.intr.get_level(), IntrLevel::Off);
    assert_ne!(cur.state(), ThreadState::Running);

    let next = next_thread_to_run(kernel, &mut state);
    let dying = cur.state() == ThreadState::Dying;
    state.prev = Some(cur.clone());

    if Arc::ptr_eq(&next, cur) {
        drop(state);
        schedule_tail(kernel);
        return;
    }

    drop(state);
    next.gate.open();
    if dying {
        return;
    }
    cur.gate.wait();
    schedule_tail(kernel);
}

/// Complete a switch on the incoming thread: mark it RUNNING, start a
/// fresh time slice, activate its address space, and reap the previous
/// thread if it was dying. The boot thread is never reaped.
pub(crate) fn schedule_tail(kernel: &Arc<Kernel>) {
    let cur = thread::try_current().expect("schedule_tail outside a kernel thread");
    assert_eq!(kernel.intr.get_level(), IntrLevel::Off);

    cur.set_state(ThreadState::Running);

    let prev = {
        let mut state = kernel.sched.state.lock();
        state.thread_ticks = 0;
        state.prev.take()
    };

    if let Some(ref user) = cur.user {
        user.spt.pagedir.activate();
    }

    if let Some(prev) = prev {
        if prev.state() == ThreadState::Dying && !kernel.sched.is_boot(&prev) {
            log::trace!("[SCHED] reaping thread '{}' ({})", prev.name(), prev.tid());
            drop(prev);
        }
    }
}

/// Preemption check: if a ready thread should run in place of the
/// current one under the active policy, yield immediately from thread
/// context, or on interrupt return from a handler.
pub(crate) fn try_yield(kernel: &Arc<Kernel>) {
    let cur = match thread::try_current() {
        Some(t) => t,
        None => return,
    };

    let old = kernel.intr.disable();
    let front = kernel.sched.state.lock().ready.front_priority();
    let needs_yield = match kernel.sched.policy {
        SchedPolicy::Priority => front.is_some_and(|p| p >= cur.priority()),
        SchedPolicy::Mlfqs => front.is_some_and(|p| p > cur.priority()),
    };
    kernel.intr.set_level(old);

    if needs_yield {
        if kernel.intr.context() {
            kernel.intr.yield_on_return();
        } else {
            thread::yield_now();
        }
    }
}

/// `priority = PRI_MAX - recent_cpu/4 - 2*nice`, clamped.
pub(crate) fn calc_priority(nice: i32, recent_cpu: Fixed) -> i32 {
    Fixed::from_int(PRI_MAX)
        .sub(recent_cpu.div_int(4))
        .sub_int(2 * nice)
        .to_int_round()
        .clamp(PRI_MIN, PRI_MAX)
}

/// Recompute one thread's mlfqs priority, repositioning it in the
/// ready queue if it is READY and the priority changed.
pub(crate) fn recalculate_priority(state: &mut SchedState, t: &Arc<Tcb>) {
    let new_priority = calc_priority(t.nice(), t.recent_cpu());
    if new_priority == t.priority() {
        return;
    }
    t.set_effective_priority(new_priority);
    if t.state() == ThreadState::Ready {
        state.ready.reinsert(t);
    }
}

/// Raise or lower a thread's effective priority from outside
/// (donation), repositioning it in the ready queue if needed.
/// Interrupts must be off; priority policy only.
pub(crate) fn priority_changed(state: &mut SchedState, t: &Arc<Tcb>, new_priority: i32) {
    t.set_effective_priority(new_priority);
    if t.state() == ThreadState::Ready {
        state.ready.reinsert(t);
    }
}

/// Timer-tick bookkeeping. Runs in (simulated) interrupt context on
/// the running thread.
pub(crate) fn tick(kernel: &Arc<Kernel>, ticks: i64) {
    assert!(kernel.intr.context());
    let cur = thread::try_current().expect("timer tick outside a kernel thread");
    let is_idle = kernel.sched.is_idle(&cur);

    let mut state = kernel.sched.state.lock();

    if is_idle {
        state.idle_ticks += 1;
    } else if cur.is_user() {
        state.user_ticks += 1;
    } else {
        state.kernel_ticks += 1;
    }

    if kernel.sched.policy == SchedPolicy::Mlfqs {
        if !is_idle {
            cur.set_recent_cpu(cur.recent_cpu().add_int(1));
        }

        if ticks % TIMER_FREQ == 0 {
            // Once a second: load_avg, then every thread's decay.
            let ready = state.ready_threads;
            let load = kernel
                .sched
                .load_avg()
                .mul(Fixed::from_int(59).div_int(60))
                .add(Fixed::from_int(1).div_int(60).mul_int(ready));
            kernel.sched.set_load_avg(load);

            let coeff = load.mul_int(2).div(load.mul_int(2).add_int(1));
            for t in state.all.clone() {
                t.set_recent_cpu(coeff.mul(t.recent_cpu()).add_int(t.nice()));
            }
        }

        if ticks - state.last_priority_update >= PRIORITY_UPDATE_FREQ {
            state.last_priority_update = ticks;
            for t in state.all.clone() {
                recalculate_priority(&mut state, &t);
            }
        }
    }

    state.thread_ticks += 1;
    if state.thread_ticks >= TIME_SLICE {
        drop(state);
        kernel.intr.yield_on_return();
    }
}

/// Log per-class tick statistics, the shutdown-time summary.
pub(crate) fn log_stats(kernel: &Kernel) {
    let state = kernel.sched.state.lock();
    log::info!(
        "[SCHED] {} idle ticks, {} kernel ticks, {} user ticks",
        state.idle_ticks,
        state.kernel_ticks,
        state.user_ticks
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_priority_clamps() {
        // Fresh thread: nice 0, recent_cpu 0.
        assert_eq!(calc_priority(0, Fixed::ZERO), PRI_MAX);
        // Heavy CPU history drives priority to the floor.
        assert_eq!(calc_priority(0, Fixed::from_int(1000)), PRI_MIN);
        // Nice shifts by two priority levels per unit.
        assert_eq!(calc_priority(10, Fixed::ZERO), PRI_MAX - 20);
        assert_eq!(calc_priority(-20, Fixed::from_int(100)), PRI_MAX);
    }

    #[test]
    fn test_calc_priority_quarter_recent_cpu() {
        // recent_cpu = 4 lowers priority by exactly one level.
        assert_eq!(calc_priority(0, Fixed::from_int(4)), PRI_MAX - 1);
        assert_eq!(calc_priority(0, Fixed::from_int(8)), PRI_MAX - 2);
    }
}
