//! Threads: creation, lifecycle, and the thread-facing scheduler API.
//!
//! A [`Tcb`] is the kernel's record of one thread. Threads are created
//! blocked, unblocked into the ready queue, and hand the CPU around
//! through [`scheduler::schedule`]. The running thread is tracked in a
//! thread-local so the public API keeps its classic shape
//! (`thread::yield_now()`, `thread::exit_with_status(2)`) without an
//! explicit kernel argument.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use super::context::Gate;
use super::scheduler;
use super::{SchedPolicy, ThreadState, PRI_MAX, PRI_MIN};
use crate::error::{KernelError, KernelResult};
use crate::fixed_point::Fixed;
use crate::kernel::Kernel;
use crate::sync::lock::LockShared;
use crate::userprog::process::{self, ChildRecord, UserSpace};

/// Thread identifier.
pub type Tid = i32;

/// Error value for [`Tid`].
pub const TID_ERROR: Tid = -1;

/// Consistency value stored in every TCB; `current()` checks it, the
/// hosted analog of the stack-overflow canary.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Unwind payload used to terminate a kernel thread from arbitrary
/// call depth. Filtered out of the panic hook at boot.
pub(crate) struct ExitToken;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Tcb>>> = const { RefCell::new(None) };
}

/// Priority-donation record: some waiter on `lock` donated `priority`
/// to the thread holding it.
pub(crate) struct Donation {
    pub lock: Arc<LockShared>,
    pub priority: i32,
}

/// Thread state mutated under scheduler protection.
pub(crate) struct TcbInner {
    pub state: ThreadState,
    /// The lock this thread is blocked acquiring, if any.
    pub wait_lock: Option<Arc<LockShared>>,
    /// Donations currently boosting this thread.
    pub donations: Vec<Donation>,
}

/// A kernel thread or user process.
pub struct Tcb {
    tid: Tid,
    name: String,
    kernel: Weak<Kernel>,
    pub(crate) gate: Gate,
    /// Effective priority: `max(base, donations)`.
    priority: AtomicI32,
    base_priority: AtomicI32,
    /// Nice value, mlfqs only.
    nice: AtomicI32,
    /// Recent CPU usage as raw Q17.14 bits, mlfqs only.
    recent_cpu: AtomicI32,
    pub(crate) inner: SpinMutex<TcbInner>,
    /// This thread's summary record in its parent, if it has a parent.
    pub(crate) child_self: Option<Arc<ChildRecord>>,
    /// Summary records of this thread's children.
    pub(crate) children: SpinMutex<Vec<Arc<ChildRecord>>>,
    /// User address space and descriptor table, if this is a process.
    pub(crate) user: Option<UserSpace>,
    /// Last known user stack pointer, consulted for stack growth.
    pub(crate) user_esp: AtomicUsize,
    magic: u32,
}

impl Tcb {
    fn new(
        kernel: &Arc<Kernel>,
        tid: Tid,
        name: &str,
        priority: i32,
        nice: i32,
        recent_cpu: Fixed,
        child_self: Option<Arc<ChildRecord>>,
        make_user: bool,
    ) -> Arc<Tcb> {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Arc::new_cyclic(|weak: &Weak<Tcb>| Tcb {
            tid,
            name: name.to_owned(),
            kernel: Arc::downgrade(kernel),
            gate: Gate::new(),
            priority: AtomicI32::new(priority),
            base_priority: AtomicI32::new(priority),
            nice: AtomicI32::new(nice),
            recent_cpu: AtomicI32::new(recent_cpu.raw()),
            inner: SpinMutex::new(TcbInner {
                state: ThreadState::Blocked,
                wait_lock: None,
                donations: Vec::new(),
            }),
            child_self,
            children: SpinMutex::new(Vec::new()),
            user: make_user.then(|| UserSpace::new(kernel, weak.clone())),
            user_esp: AtomicUsize::new(0),
            magic: THREAD_MAGIC,
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel torn down under thread")
    }

    /// Effective priority, as used by every scheduling decision.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn base_priority(&self) -> i32 {
        self.base_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_effective_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn set_base_priority(&self, priority: i32) {
        self.base_priority.store(priority, Ordering::Release);
    }

    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::Acquire)
    }

    pub(crate) fn set_nice_raw(&self, nice: i32) {
        self.nice.store(nice, Ordering::Release);
    }

    pub(crate) fn recent_cpu(&self) -> Fixed {
        Fixed::from_raw(self.recent_cpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_recent_cpu(&self, value: Fixed) {
        self.recent_cpu.store(value.raw(), Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.lock().state = state;
    }

    pub fn is_user(&self) -> bool {
        self.user.is_some()
    }

    /// User address space, panicking for pure kernel threads.
    pub fn user_space(&self) -> &UserSpace {
        self.user.as_ref().expect("not a user thread")
    }

    #[cfg(test)]
    pub(crate) fn bare_for_tests(priority: i32) -> Arc<Tcb> {
        Arc::new(Tcb {
            tid: 0,
            name: "test".to_owned(),
            kernel: Weak::new(),
            gate: Gate::new(),
            priority: AtomicI32::new(priority),
            base_priority: AtomicI32::new(priority),
            nice: AtomicI32::new(0),
            recent_cpu: AtomicI32::new(0),
            inner: SpinMutex::new(TcbInner {
                state: ThreadState::Blocked,
                wait_lock: None,
                donations: Vec::new(),
            }),
            child_self: None,
            children: SpinMutex::new(Vec::new()),
            user: None,
            user_esp: AtomicUsize::new(0),
            magic: THREAD_MAGIC,
        })
    }
}

/// The running thread's TCB.
///
/// Panics when called from an OS thread that is not a kernel thread of
/// any kernel instance, or when the TCB is corrupted.
pub fn current() -> Arc<Tcb> {
    let t = try_current().expect("not called from a kernel thread");
    assert_eq!(t.magic, THREAD_MAGIC, "corrupted thread record");
    assert_eq!(t.state(), ThreadState::Running);
    t
}

pub fn try_current() -> Option<Arc<Tcb>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The running thread's tid.
pub fn tid() -> Tid {
    current().tid()
}

pub(crate) fn set_current(t: Option<Arc<Tcb>>) {
    CURRENT.with(|c| *c.borrow_mut() = t);
}

/// Create a new kernel thread running `f` and add it to the ready
/// queue. The new thread may be scheduled before `spawn` returns if
/// its priority beats the caller's.
pub fn spawn(
    name: &str,
    priority: i32,
    f: impl FnOnce() + Send + 'static,
) -> KernelResult<Tid> {
    let cur = current();
    let tcb = spawn_inner(
        &cur.kernel(),
        name,
        priority,
        false,
        false,
        Box::new(move || {
            f();
            0
        }),
    )?;
    Ok(tcb.tid())
}

/// Shared spawn path for kernel threads, user processes, and the idle
/// thread. Creates the TCB (blocked), registers it, starts its backing
/// OS thread parked on the gate, unblocks it, and applies the usual
/// preemption check.
pub(crate) fn spawn_inner(
    kernel: &Arc<Kernel>,
    name: &str,
    priority: i32,
    make_user: bool,
    is_idle: bool,
    body: Box<dyn FnOnce() -> i32 + Send>,
) -> KernelResult<Arc<Tcb>> {
    let parent = try_current();
    let tid = kernel.sched.allocate_tid();

    // New threads inherit the creator's nice and recent_cpu; under
    // mlfqs the initial priority is computed from them.
    let (nice, recent_cpu) = match &parent {
        Some(p) => (p.nice(), p.recent_cpu()),
        None => (0, Fixed::ZERO),
    };
    let priority = match kernel.sched.policy {
        SchedPolicy::Priority => priority,
        SchedPolicy::Mlfqs => scheduler::calc_priority(nice, recent_cpu),
    };

    let child_self = parent.as_ref().map(|_| Arc::new(ChildRecord::new(tid)));
    let tcb = Tcb::new(
        kernel,
        tid,
        name,
        priority,
        nice,
        recent_cpu,
        child_self.clone(),
        make_user,
    );
    if let (Some(parent), Some(record)) = (&parent, child_self) {
        parent.children.lock().push(record);
    }

    // The idle thread must be recognizable before it becomes ready so
    // it is never counted among the runnable threads.
    if is_idle {
        kernel.sched.set_idle(tcb.clone());
    }

    {
        let old = kernel.intr.disable();
        kernel.sched.state.lock().all.push(tcb.clone());
        kernel.intr.set_level(old);
    }

    let entry_tcb = tcb.clone();
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || entry(entry_tcb, body))
        .map_err(|_| KernelError::OutOfMemory {
            requested: std::mem::size_of::<Tcb>(),
        })?;

    unblock(&tcb);
    scheduler::try_yield(kernel);
    Ok(tcb)
}

/// Transform the calling OS thread into the kernel's boot thread.
/// This works because nothing is scheduled yet; the boot thread
/// bootstraps itself directly into the RUNNING state.
pub(crate) fn adopt_boot(kernel: &Arc<Kernel>, name: &str) -> Arc<Tcb> {
    assert_eq!(kernel.intr.get_level(), crate::intr::IntrLevel::Off);
    assert!(try_current().is_none(), "thread already adopted");

    let tid = kernel.sched.allocate_tid();
    let priority = match kernel.sched.policy {
        SchedPolicy::Priority => super::PRI_DEFAULT,
        SchedPolicy::Mlfqs => scheduler::calc_priority(0, Fixed::ZERO),
    };
    let tcb = Tcb::new(kernel, tid, name, priority, 0, Fixed::ZERO, None, false);
    tcb.set_state(ThreadState::Running);
    {
        let mut state = kernel.sched.state.lock();
        state.all.push(tcb.clone());
        state.ready_threads += 1;
    }
    kernel.sched.set_boot(tcb.clone());
    set_current(Some(tcb.clone()));
    tcb
}

/// First code run by every spawned thread: wait to be scheduled for
/// the first time, finish the switch, enable interrupts, run the body,
/// and exit with its status.
fn entry(tcb: Arc<Tcb>, body: Box<dyn FnOnce() -> i32 + Send>) {
    tcb.gate.wait();
    set_current(Some(tcb.clone()));
    let kernel = tcb.kernel();
    scheduler::schedule_tail(&kernel);
    kernel.intr.enable();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let status = body();
        exit_with_status(status);
    }));
    if let Err(payload) = outcome {
        if !payload.is::<ExitToken>() {
            // A genuine panic escaped the thread body. Tear the thread
            // down anyway so waiters observe status -1 and the
            // scheduler stays consistent, then let the payload go.
            log::error!("[THREAD] '{}' panicked; exiting with -1", tcb.name());
            let _ = panic::catch_unwind(AssertUnwindSafe(|| exit_with_status(-1)));
            panic::resume_unwind(payload);
        }
    }
}

/// Terminate the current thread with an exit status. Never returns.
pub fn exit_with_status(status: i32) -> ! {
    let cur = current();
    let kernel = cur.kernel();
    assert!(!kernel.intr.context());
    assert!(
        !kernel.sched.is_boot(&cur),
        "boot thread must not exit through the scheduler"
    );

    process::exit(&cur, status);

    kernel.intr.disable();
    let mut state = kernel.sched.state.lock();
    state.all.retain(|t| !Arc::ptr_eq(t, &cur));
    if !kernel.sched.is_idle(&cur) {
        state.ready_threads -= 1;
    }
    cur.set_state(ThreadState::Dying);
    scheduler::schedule(&kernel, state, &cur);

    set_current(None);
    panic::panic_any(ExitToken);
}

/// Put the current thread to sleep until [`unblock`]ed.
///
/// Must be called with interrupts disabled; the synchronization
/// primitives are usually the better interface.
pub fn block() {
    let cur = current();
    let kernel = cur.kernel();
    assert!(!kernel.intr.context());
    assert_eq!(kernel.intr.get_level(), crate::intr::IntrLevel::Off);

    let mut state = kernel.sched.state.lock();
    if !kernel.sched.is_idle(&cur) {
        state.ready_threads -= 1;
    }
    cur.set_state(ThreadState::Blocked);
    scheduler::schedule(&kernel, state, &cur);
}

/// Transition a blocked thread to ready. Does not preempt the caller,
/// so an interrupt-disabling caller can unblock and keep updating its
/// own state atomically.
pub fn unblock(t: &Arc<Tcb>) {
    let kernel = t.kernel();
    let old = kernel.intr.disable();
    {
        let mut state = kernel.sched.state.lock();
        assert_eq!(t.state(), ThreadState::Blocked);
        state.ready.insert(t.clone());
        t.set_state(ThreadState::Ready);
        if !kernel.sched.is_idle(t) {
            state.ready_threads += 1;
        }
    }
    kernel.intr.set_level(old);
}

/// Yield the CPU. The current thread goes back into the ready queue
/// and may be rescheduled immediately.
pub fn yield_now() {
    let cur = current();
    let kernel = cur.kernel();
    assert!(!kernel.intr.context());

    let old = kernel.intr.disable();
    let mut state = kernel.sched.state.lock();
    if !kernel.sched.is_idle(&cur) {
        state.ready.insert(cur.clone());
    }
    cur.set_state(ThreadState::Ready);
    scheduler::schedule(&kernel, state, &cur);
    kernel.intr.set_level(old);
}

/// Invoke `f` on every live thread, with interrupts masked for the
/// duration of the walk.
pub fn foreach(f: &mut dyn FnMut(&Arc<Tcb>)) {
    let cur = current();
    let kernel = cur.kernel();

    let old = kernel.intr.disable();
    let all: Vec<Arc<Tcb>> = kernel.sched.state.lock().all.clone();
    for t in &all {
        f(t);
    }
    kernel.intr.set_level(old);
}

/// Set the current thread's base priority. Priority policy only.
///
/// Active donations keep the effective priority at
/// `max(new_base, donations)`; afterwards the thread yields if it is
/// no longer the highest.
pub fn set_priority(new_priority: i32) {
    let cur = current();
    let kernel = cur.kernel();
    assert_eq!(kernel.sched.policy, SchedPolicy::Priority);
    assert!((PRI_MIN..=PRI_MAX).contains(&new_priority));

    let old = kernel.intr.disable();
    cur.set_base_priority(new_priority);
    let donated = cur
        .inner
        .lock()
        .donations
        .iter()
        .map(|d| d.priority)
        .max();
    cur.set_effective_priority(donated.map_or(new_priority, |d| d.max(new_priority)));
    kernel.intr.set_level(old);

    scheduler::try_yield(&kernel);
}

/// The current thread's effective priority.
pub fn get_priority() -> i32 {
    current().priority()
}

/// Set the current thread's nice value and recompute its priority.
/// Mlfqs only.
pub fn set_nice(nice: i32) {
    let cur = current();
    let kernel = cur.kernel();
    assert_eq!(kernel.sched.policy, SchedPolicy::Mlfqs);
    cur.set_nice_raw(nice.clamp(-20, 20));

    let old = kernel.intr.disable();
    {
        let mut state = kernel.sched.state.lock();
        scheduler::recalculate_priority(&mut state, &cur);
    }
    kernel.intr.set_level(old);

    scheduler::try_yield(&kernel);
}

pub fn get_nice() -> i32 {
    current().nice()
}

/// 100 times the current thread's recent_cpu value.
pub fn get_recent_cpu() -> i32 {
    current().recent_cpu().mul_int(100).to_int_round()
}

/// 100 times the system load average.
pub fn get_load_avg() -> i32 {
    current().kernel().sched.load_avg().mul_int(100).to_int_round()
}
