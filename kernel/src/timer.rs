//! System timer.
//!
//! The hosted kernel has no hardware timer; tests (or a harness) fire
//! [`interrupt_tick`] on the running thread to simulate the periodic
//! interrupt. Each tick drives the scheduler's bookkeeping: per-class
//! statistics, the mlfqs cadences, and time-slice preemption, honored
//! at simulated interrupt return.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::kernel::Kernel;
use crate::sched::{scheduler, thread};

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

/// Per-kernel tick counter.
pub struct Timer {
    ticks: AtomicI64,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            ticks: AtomicI64::new(0),
        }
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }
}

/// Deliver one timer interrupt to the running thread.
///
/// Runs the tick handler in simulated interrupt context and, on
/// return, performs any preemption the handler requested.
pub fn interrupt_tick(kernel: &Arc<Kernel>) {
    let old = kernel.intr.enter_handler();
    let ticks = kernel.timer.ticks.fetch_add(1, Ordering::AcqRel) + 1;
    scheduler::tick(kernel, ticks);
    let wants_yield = kernel.intr.exit_handler(old);

    if wants_yield {
        thread::yield_now();
    }
}

/// Deliver `n` timer interrupts back to back.
pub fn advance(kernel: &Arc<Kernel>, n: i64) {
    for _ in 0..n {
        interrupt_tick(kernel);
    }
}

/// Sleep for approximately `ms` milliseconds of wall-clock time,
/// yielding the CPU so other threads can run meanwhile.
///
/// The hosted stand-in for a tick-driven sleep; its only kernel client
/// is the eviction retry backoff, which needs "let others run for a
/// while", not tick accuracy.
pub fn msleep(ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        thread::yield_now();
        std::thread::sleep(Duration::from_micros(200));
    }
}
