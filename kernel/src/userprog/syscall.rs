//! The system-call surface.
//!
//! The dispatcher reads the syscall number and its arguments as 32-bit
//! words at indexed offsets from the interrupted user stack pointer.
//! Every user pointer is validated against the SPT and its backing
//! pages are pinned across the access; any violation terminates the
//! process with status -1. Directory calls are non-goals and panic.

use std::sync::Arc;

use super::usermem::{self, MAX_ARGS_LEN};
use super::{process, IntrFrame};
use crate::kernel::Kernel;
use crate::mm::file_page::{do_mmap, do_munmap};
use crate::sched::thread;

/// System call numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    Mmap = 13,
    Munmap = 14,
    Chdir = 15,
    Mkdir = 16,
    Readdir = 17,
    Isdir = 18,
    Inumber = 19,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(nr: u32) -> Result<Self, ()> {
        use Syscall::*;
        Ok(match nr {
            0 => Halt,
            1 => Exit,
            2 => Exec,
            3 => Wait,
            4 => Create,
            5 => Remove,
            6 => Open,
            7 => Filesize,
            8 => Read,
            9 => Write,
            10 => Seek,
            11 => Tell,
            12 => Close,
            13 => Mmap,
            14 => Munmap,
            15 => Chdir,
            16 => Mkdir,
            17 => Readdir,
            18 => Isdir,
            19 => Inumber,
            _ => return Err(()),
        })
    }
}

/// Terminate the process for a memory-safety violation on syscall
/// arguments.
fn kill_process() -> ! {
    thread::exit_with_status(-1);
}

/// Argument word `index` above the interrupted stack pointer. A bad
/// stack kills the process.
fn argraw(kernel: &Arc<Kernel>, frame: &IntrFrame, index: usize) -> u32 {
    match usermem::read_u32(kernel, frame, frame.esp + 4 * index) {
        Ok(word) => word,
        Err(_) => kill_process(),
    }
}

/// A string argument, validated and copied in. A bad pointer kills
/// the process.
fn argstr(kernel: &Arc<Kernel>, frame: &IntrFrame, va: usize) -> String {
    match usermem::read_cstr(kernel, frame, va, MAX_ARGS_LEN) {
        Ok(s) => s,
        Err(_) => kill_process(),
    }
}

/// Dispatch the system call described by `frame`. Returns the
/// syscall's return value. Must be called on a user thread.
pub fn dispatch(frame: &IntrFrame) -> i32 {
    let cur = thread::current();
    assert!(cur.is_user(), "syscall from a kernel thread");
    let kernel = cur.kernel();
    usermem::set_esp(frame.esp);

    let nr = argraw(&kernel, frame, 0);
    let syscall = match Syscall::try_from(nr) {
        Ok(s) => s,
        Err(()) => kill_process(),
    };
    log::trace!("[SYSCALL] {} invokes {:?}", cur.name(), syscall);

    match syscall {
        Syscall::Halt => sys_halt(&kernel),
        Syscall::Exit => sys_exit(&kernel, frame),
        Syscall::Exec => sys_exec(&kernel, frame),
        Syscall::Wait => sys_wait(&kernel, frame),
        Syscall::Create => sys_create(&kernel, frame),
        Syscall::Remove => sys_remove(&kernel, frame),
        Syscall::Open => sys_open(&kernel, frame),
        Syscall::Filesize => sys_filesize(&kernel, frame),
        Syscall::Read => sys_read(&kernel, frame),
        Syscall::Write => sys_write(&kernel, frame),
        Syscall::Seek => sys_seek(&kernel, frame),
        Syscall::Tell => sys_tell(&kernel, frame),
        Syscall::Close => sys_close(&kernel, frame),
        Syscall::Mmap => sys_mmap(&kernel, frame),
        Syscall::Munmap => sys_munmap(&kernel, frame),
        // Directory support is a non-goal.
        Syscall::Chdir => panic!("sys_chdir"),
        Syscall::Mkdir => panic!("sys_mkdir"),
        Syscall::Readdir => panic!("sys_readdir"),
        Syscall::Isdir => panic!("sys_isdir"),
        Syscall::Inumber => panic!("sys_inumber"),
    }
}

fn sys_halt(kernel: &Arc<Kernel>) -> i32 {
    kernel.halt();
    thread::exit_with_status(0);
}

fn sys_exit(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let status = argraw(kernel, frame, 1) as i32;
    thread::exit_with_status(status);
}

fn sys_exec(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let cmd_ptr = argraw(kernel, frame, 1) as usize;
    let cmd_line = argstr(kernel, frame, cmd_ptr);
    match process::execute(kernel, &cmd_line) {
        Ok(tid) => tid,
        Err(_) => -1,
    }
}

fn sys_wait(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let tid = argraw(kernel, frame, 1) as i32;
    process::wait(tid)
}

fn sys_create(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let name_ptr = argraw(kernel, frame, 1) as usize;
    let initial_size = argraw(kernel, frame, 2) as usize;
    let name = argstr(kernel, frame, name_ptr);

    kernel.fs.lock().acquire();
    let created = kernel.fs.create(&name, initial_size).is_ok();
    kernel.fs.lock().release();
    created as i32
}

fn sys_remove(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let name_ptr = argraw(kernel, frame, 1) as usize;
    let name = argstr(kernel, frame, name_ptr);

    kernel.fs.lock().acquire();
    let removed = kernel.fs.remove(&name).is_ok();
    kernel.fs.lock().release();
    removed as i32
}

fn sys_open(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let name_ptr = argraw(kernel, frame, 1) as usize;
    let name = argstr(kernel, frame, name_ptr);

    kernel.fs.lock().acquire();
    let opened = kernel.fs.open(&name);
    kernel.fs.lock().release();

    match opened {
        Ok(file) => thread::current().user_space().install_fd(file),
        Err(_) => -1,
    }
}

fn sys_filesize(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let user = thread::current();
    let user = user.user_space();

    kernel.fs.lock().acquire();
    let size = user.with_file(fd, |file| file.length() as i32);
    kernel.fs.lock().release();
    size.unwrap_or(-1)
}

fn sys_read(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let buffer = argraw(kernel, frame, 2) as usize;
    let size = argraw(kernel, frame, 3) as usize;

    let _pin = match usermem::check_and_pin(kernel, frame, buffer, size, true) {
        Ok(guard) => guard,
        Err(_) => kill_process(),
    };

    let mut data = vec![0u8; size];
    let n = if fd == 0 {
        kernel.console_read(&mut data)
    } else {
        let user = thread::current();
        let user = user.user_space();
        kernel.fs.lock().acquire();
        let n = user.with_file(fd, |file| file.read(&mut data));
        kernel.fs.lock().release();
        match n {
            Ok(n) => n,
            Err(_) => return -1,
        }
    };

    match usermem::write_bytes_at(kernel, frame, buffer, &data[..n]) {
        Ok(()) => n as i32,
        Err(_) => kill_process(),
    }
}

fn sys_write(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let buffer = argraw(kernel, frame, 2) as usize;
    let size = argraw(kernel, frame, 3) as usize;

    let _pin = match usermem::check_and_pin(kernel, frame, buffer, size, false) {
        Ok(guard) => guard,
        Err(_) => kill_process(),
    };

    let mut data = vec![0u8; size];
    if usermem::read_bytes_at(kernel, frame, buffer, &mut data).is_err() {
        kill_process();
    }

    if fd == 1 {
        kernel.console_write(&data);
        return size as i32;
    }

    let user = thread::current();
    let user = user.user_space();
    kernel.fs.lock().acquire();
    let written = user.with_file(fd, |file| file.write(&data));
    kernel.fs.lock().release();
    match written {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn sys_seek(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let position = argraw(kernel, frame, 2) as usize;
    let user = thread::current();
    let user = user.user_space();

    kernel.fs.lock().acquire();
    let sought = user.with_file(fd, |file| file.seek(position));
    kernel.fs.lock().release();
    match sought {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_tell(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let user = thread::current();
    let user = user.user_space();

    kernel.fs.lock().acquire();
    let pos = user.with_file(fd, |file| file.tell() as i32);
    kernel.fs.lock().release();
    pos.unwrap_or(-1)
}

fn sys_close(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let user = thread::current();
    let user = user.user_space();

    kernel.fs.lock().acquire();
    let closed = user.close_fd(fd);
    kernel.fs.lock().release();
    match closed {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// MMAP(fd, addr): map the whole file writable at `addr`, returning
/// the mapid or -1.
fn sys_mmap(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let fd = argraw(kernel, frame, 1) as i32;
    let addr = argraw(kernel, frame, 2) as usize;

    let cur = thread::current();
    let user = cur.user_space();
    let spt = user.spt.clone();
    let mapped = user.with_file(fd, |file| do_mmap(&spt, addr, file.length(), true, file, 0));
    match mapped {
        Ok(Ok(mapid)) => mapid,
        _ => -1,
    }
}

fn sys_munmap(kernel: &Arc<Kernel>, frame: &IntrFrame) -> i32 {
    let mapid = argraw(kernel, frame, 1) as i32;
    let spt = thread::current().user_space().spt.clone();
    let _ = do_munmap(&spt, mapid);
    0
}
