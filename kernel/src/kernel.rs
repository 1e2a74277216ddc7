//! Kernel instance: boot arguments, subsystem ownership, and the
//! boot/start sequence.
//!
//! A [`Kernel`] value owns all the state that would otherwise live in
//! process-wide globals: scheduler, interrupt cell, timer, user page
//! pool, frame table, swap table, and file system. Independent
//! instances can run side by side in one test process.

use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use spin::Mutex as SpinMutex;

use crate::fs::FileSys;
use crate::intr::IntrCell;
use crate::mm::frame::FrameTable;
use crate::mm::palloc::UserPool;
use crate::mm::swap::SwapTable;
use crate::sched::scheduler::Scheduler;
use crate::sched::thread::{self, ExitToken};
use crate::sched::{SchedPolicy, PRI_MIN};
use crate::sync::Semaphore;
use crate::timer::Timer;
use crate::userprog::process::ProgramRegistry;

/// Boot configuration, the hosted form of the kernel command line.
#[derive(Debug, Clone)]
pub struct BootArgs {
    /// Create a fresh file system image.
    pub format: bool,
    /// Select the multi-level feedback queue scheduler (`-o mlfqs`).
    pub mlfqs: bool,
    /// Number of 4 KiB frames in the user pool (`-ul`).
    pub user_pages: usize,
    /// Number of page-sized slots on the swap device.
    pub swap_pages: usize,
}

impl Default for BootArgs {
    fn default() -> Self {
        Self {
            format: true,
            mlfqs: false,
            user_pages: 256,
            swap_pages: 1024,
        }
    }
}

impl BootArgs {
    /// Parse command-line-style tokens: `-f`, `-o mlfqs`, `-ul N`.
    /// Unknown tokens are ignored.
    pub fn parse(tokens: &[&str]) -> Self {
        let mut args = Self {
            format: false,
            ..Self::default()
        };
        let mut iter = tokens.iter().peekable();
        while let Some(token) = iter.next() {
            match *token {
                "-f" => args.format = true,
                "-o" => {
                    if iter.next_if(|s| **s == "mlfqs").is_some() {
                        args.mlfqs = true;
                    }
                }
                "-ul" => {
                    if let Some(n) = iter.next().and_then(|s| s.parse().ok()) {
                        args.user_pages = n;
                    }
                }
                _ => {}
            }
        }
        args
    }
}

/// One kernel instance.
pub struct Kernel {
    pub(crate) sched: Scheduler,
    pub(crate) intr: IntrCell,
    pub(crate) timer: Timer,
    pub(crate) palloc: UserPool,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) fs: FileSys,
    pub(crate) programs: ProgramRegistry,
    console_out: SpinMutex<Vec<u8>>,
    console_in: SpinMutex<VecDeque<u8>>,
    halted: AtomicBool,
}

impl Kernel {
    /// Construct a kernel from boot arguments. Interrupts start
    /// disabled; call [`adopt_boot_thread`](Self::adopt_boot_thread)
    /// and then [`start`](Self::start) to begin scheduling.
    pub fn boot(args: &BootArgs) -> Arc<Kernel> {
        install_exit_token_hook();

        let policy = if args.mlfqs {
            SchedPolicy::Mlfqs
        } else {
            SchedPolicy::Priority
        };
        log::debug!(
            "[BOOT] policy={:?} user_pages={} swap_pages={} format={}",
            policy,
            args.user_pages,
            args.swap_pages,
            args.format
        );

        Arc::new(Kernel {
            sched: Scheduler::new(policy),
            intr: IntrCell::new(),
            timer: Timer::new(),
            palloc: UserPool::new(args.user_pages),
            frames: FrameTable::new(),
            swap: SwapTable::new(args.swap_pages),
            fs: FileSys::new(args.format),
            programs: ProgramRegistry::new(),
            console_out: SpinMutex::new(Vec::new()),
            console_in: SpinMutex::new(VecDeque::new()),
            halted: AtomicBool::new(false),
        })
    }

    /// Transform the calling OS thread into this kernel's boot thread.
    pub fn adopt_boot_thread(self: &Arc<Self>, name: &str) {
        thread::adopt_boot(self, name);
    }

    /// Start preemptive scheduling: create the idle thread, enable
    /// interrupts, and wait for idle to finish initializing.
    pub fn start(self: &Arc<Self>) {
        let idle_started = Semaphore::new(0);
        let started = idle_started.clone();
        thread::spawn_inner(
            self,
            "idle",
            PRI_MIN,
            false,
            true,
            Box::new(move || {
                idle_loop(started);
                0
            }),
        )
        .expect("cannot create idle thread");

        self.intr.enable();
        idle_started.down();
    }

    pub fn policy(&self) -> SchedPolicy {
        self.sched.policy
    }

    /// The file system.
    pub fn fs(&self) -> &FileSys {
        &self.fs
    }

    /// The swap store.
    pub fn swap_table(&self) -> &SwapTable {
        &self.swap
    }

    /// The global frame table.
    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    /// The user page pool.
    pub fn user_pool(&self) -> &UserPool {
        &self.palloc
    }

    /// Snapshot of every live thread.
    pub fn threads(&self) -> Vec<Arc<crate::sched::Tcb>> {
        self.sched.state.lock().all.clone()
    }

    /// Look up a live thread by tid.
    pub fn thread_by_tid(&self, tid: crate::sched::Tid) -> Option<Arc<crate::sched::Tcb>> {
        self.sched
            .state
            .lock()
            .all
            .iter()
            .find(|t| t.tid() == tid)
            .cloned()
    }

    /// Mark the kernel halted (the HALT syscall). Scheduling state is
    /// left intact; the caller is expected to exit.
    pub fn halt(&self) {
        crate::sched::scheduler::log_stats(self);
        self.halted.store(true, Ordering::Release);
        log::info!("[BOOT] powering off");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Everything user processes have written to the console.
    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.console_out.lock()).into_owned()
    }

    pub(crate) fn console_write(&self, bytes: &[u8]) {
        self.console_out.lock().extend_from_slice(bytes);
    }

    /// Queue bytes for user processes to read from fd 0.
    pub fn feed_input(&self, bytes: &[u8]) {
        self.console_in.lock().extend(bytes.iter().copied());
    }

    pub(crate) fn console_read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.console_in.lock();
        let n = buf.len().min(input.len());
        for b in buf.iter_mut().take(n) {
            *b = input.pop_front().unwrap();
        }
        n
    }

    /// Timer ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.timer.ticks()
    }

    /// Per-class tick statistics `(idle, kernel, user)`.
    pub fn tick_stats(&self) -> (u64, u64, u64) {
        let state = self.sched.state.lock();
        (state.idle_ticks, state.kernel_ticks, state.user_ticks)
    }
}

/// Idle thread body: publish ourselves, then block forever, letting
/// the scheduler resurrect us whenever the ready queue is empty.
fn idle_loop(idle_started: Semaphore) {
    let cur = thread::current();
    let kernel = cur.kernel();
    idle_started.up();

    loop {
        kernel.intr.disable();
        thread::block();
        // Scheduled again: nothing is ready. Spin gently until some
        // event (driven from the running thread) makes one ready.
        kernel.intr.enable();
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
}

/// Filter the thread-exit unwind token out of the default panic hook
/// so intentional thread termination does not spam test output.
fn install_exit_token_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitToken>().is_none() {
                default(info);
            }
        }));
    });
}
