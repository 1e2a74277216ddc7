//! Process lifecycle: user address spaces, child bookkeeping,
//! exit/wait, and the program registry behind EXEC.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::kernel::Kernel;
use crate::mm::spt::SupplementalPageTable;
use crate::sched::thread::{self, Tcb, Tid};
use crate::sched::PRI_DEFAULT;
use crate::sync::Semaphore;

/// A child's summary record, owned jointly by parent and child. It
/// outlives the child so the parent can still collect the status.
pub struct ChildRecord {
    pub tid: Tid,
    exit_status: SpinMutex<i32>,
    pub(crate) exit_sema: Semaphore,
    parent_exited: AtomicBool,
}

impl ChildRecord {
    pub(crate) fn new(tid: Tid) -> Self {
        Self {
            tid,
            exit_status: SpinMutex::new(-1),
            exit_sema: Semaphore::new(0),
            parent_exited: AtomicBool::new(false),
        }
    }

    pub fn exit_status(&self) -> i32 {
        *self.exit_status.lock()
    }

    fn set_exit_status(&self, status: i32) {
        *self.exit_status.lock() = status;
    }

    pub(crate) fn mark_parent_exited(&self) {
        self.parent_exited.store(true, Ordering::Release);
    }

    pub fn parent_exited(&self) -> bool {
        self.parent_exited.load(Ordering::Acquire)
    }
}

/// One open file descriptor.
pub struct FileDescriptor {
    pub fd: i32,
    pub file: File,
}

/// The user half of a thread: address space and descriptor table.
pub struct UserSpace {
    pub spt: Arc<SupplementalPageTable>,
    files: SpinMutex<Vec<FileDescriptor>>,
    next_fd: AtomicI32,
    pub(crate) exec_file: SpinMutex<Option<File>>,
}

impl UserSpace {
    pub(crate) fn new(kernel: &Arc<Kernel>, thread: Weak<Tcb>) -> Self {
        Self {
            spt: SupplementalPageTable::new(kernel, thread),
            files: SpinMutex::new(Vec::new()),
            // 0 and 1 are the console.
            next_fd: AtomicI32::new(2),
            exec_file: SpinMutex::new(None),
        }
    }

    /// Register an open file and return its descriptor.
    pub fn install_fd(&self, file: File) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::AcqRel);
        self.files.lock().push(FileDescriptor { fd, file });
        fd
    }

    /// Run `f` on the open file named by `fd`.
    pub fn with_file<R>(&self, fd: i32, f: impl FnOnce(&File) -> R) -> KernelResult<R> {
        let files = self.files.lock();
        let descriptor = files
            .iter()
            .find(|d| d.fd == fd)
            .ok_or(KernelError::BadFileDescriptor { fd })?;
        Ok(f(&descriptor.file))
    }

    /// Close `fd`, dropping its handle.
    pub fn close_fd(&self, fd: i32) -> KernelResult<()> {
        let mut files = self.files.lock();
        let pos = files
            .iter()
            .position(|d| d.fd == fd)
            .ok_or(KernelError::BadFileDescriptor { fd })?;
        files.remove(pos);
        Ok(())
    }

    pub fn open_fd_count(&self) -> usize {
        self.files.lock().len()
    }
}

/// Programs EXEC can start, keyed by name.
pub struct ProgramRegistry {
    programs: SpinMutex<BTreeMap<String, Arc<dyn Fn() -> i32 + Send + Sync>>>,
}

impl ProgramRegistry {
    pub(crate) fn new() -> Self {
        Self {
            programs: SpinMutex::new(BTreeMap::new()),
        }
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Fn() -> i32 + Send + Sync>> {
        self.programs.lock().get(name).cloned()
    }
}

/// Register a user program body under `name` for EXEC.
pub fn register_program(
    kernel: &Arc<Kernel>,
    name: &str,
    body: impl Fn() -> i32 + Send + Sync + 'static,
) {
    kernel
        .programs
        .programs
        .lock()
        .insert(name.to_owned(), Arc::new(body));
}

/// Create a user process running `f`; its return value is the exit
/// status.
pub fn spawn_user(
    name: &str,
    priority: i32,
    f: impl FnOnce() -> i32 + Send + 'static,
) -> KernelResult<Tid> {
    let cur = thread::current();
    let tcb = thread::spawn_inner(&cur.kernel(), name, priority, true, false, Box::new(f))?;
    Ok(tcb.tid())
}

/// Spawn a user process then wait for it; returns its exit status.
pub fn run_user(name: &str, f: impl FnOnce() -> i32 + Send + 'static) -> i32 {
    match spawn_user(name, PRI_DEFAULT, f) {
        Ok(tid) => wait(tid),
        Err(_) => -1,
    }
}

/// Start the registered program named by the first token of
/// `cmd_line` as a new user process.
pub fn execute(kernel: &Arc<Kernel>, cmd_line: &str) -> KernelResult<Tid> {
    let name = cmd_line
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument { name: "cmd_line" })?;
    let body = kernel
        .programs
        .get(name)
        .ok_or(KernelError::FileNotFound)?;

    let tcb = thread::spawn_inner(
        kernel,
        name,
        PRI_DEFAULT,
        true,
        false,
        Box::new(move || body()),
    )?;

    // Keep a handle on the executable image if one exists on disk.
    if let Ok(image) = kernel.fs.open(name) {
        *tcb.user_space().exec_file.lock() = Some(image);
    }
    Ok(tcb.tid())
}

/// Wait for a direct child to exit and collect its status. A tid that
/// is not an unwaited child of the caller yields -1; waiting twice on
/// the same child yields -1 the second time.
pub fn wait(child_tid: Tid) -> i32 {
    let cur = thread::current();
    let record = {
        let mut children = cur.children.lock();
        match children.iter().position(|r| r.tid == child_tid) {
            Some(pos) => children.remove(pos),
            None => return -1,
        }
    };

    record.exit_sema.down();
    record.exit_status()
}

/// Thread-exit hook: record the status, tear down the user half if
/// present, flag children, and wake the parent.
pub(crate) fn exit(cur: &Arc<Tcb>, status: i32) {
    if let Some(record) = &cur.child_self {
        record.set_exit_status(status);
    }

    if let Some(user) = &cur.user {
        log::info!("[PROC] {}: exit({})", cur.name(), status);
        user.spt.kill();
        user.spt.pagedir.destroy();
        user.files.lock().clear();
        user.exec_file.lock().take();
    }

    for child in cur.children.lock().iter() {
        child.mark_parent_exited();
    }

    // An orphan has nobody left to collect its status.
    if let Some(record) = &cur.child_self {
        if !record.parent_exited() {
            record.exit_sema.up();
        }
    }
}
