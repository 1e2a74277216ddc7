//! User-program scenarios: the syscall surface end to end, argument
//! validation, exec/wait, and process exit statuses.

use std::sync::Arc;

use pyrite_kernel::mm::{PGSIZE, PHYS_BASE};
use pyrite_kernel::userprog::syscall::{self, Syscall};
use pyrite_kernel::userprog::{process, usermem, IntrFrame};
use pyrite_kernel::{BootArgs, Kernel};

fn boot() -> Arc<Kernel> {
    let kernel = Kernel::boot(&BootArgs::default());
    kernel.adopt_boot_thread("main");
    kernel.start();
    kernel
}

/// Stack layout used by every test program: the syscall number and
/// arguments as 32-bit words at the interrupted stack pointer.
const ESP: usize = PHYS_BASE - 256;

/// Scratch area in the stack page, above the argument words.
const SCRATCH: usize = PHYS_BASE - 192;

fn invoke(args: &[u32]) -> i32 {
    usermem::set_esp(ESP);
    for (i, word) in args.iter().enumerate() {
        usermem::user_store(ESP + 4 * i, &word.to_le_bytes());
    }
    syscall::dispatch(&IntrFrame { esp: ESP })
}

/// Place a NUL-terminated string in the stack page and return its
/// address.
fn place_str(at: usize, s: &str) -> u32 {
    usermem::set_esp(ESP);
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    usermem::user_store(at, &bytes);
    at as u32
}

#[test]
fn test_write_to_console() {
    let kernel = boot();

    let status = process::run_user("hello", || {
        usermem::set_esp(ESP);
        usermem::user_store(SCRATCH, b"hello, kernel");
        invoke(&[Syscall::Write as u32, 1, SCRATCH as u32, 13])
    });
    assert_eq!(status, 13);
    assert_eq!(kernel.console_output(), "hello, kernel");
}

#[test]
fn test_read_from_console() {
    let kernel = boot();
    kernel.feed_input(b"typed");

    let status = process::run_user("reader", || {
        usermem::set_esp(ESP);
        let n = invoke(&[Syscall::Read as u32, 0, SCRATCH as u32, 16]);
        let mut buf = vec![0u8; n as usize];
        usermem::user_load(SCRATCH, &mut buf);
        assert_eq!(&buf, b"typed");
        n
    });
    assert_eq!(status, 5);
}

#[test]
fn test_file_syscall_round_trip() {
    let _kernel = boot();

    let status = process::run_user("files", || {
        let name = place_str(SCRATCH, "notes.txt");

        assert_eq!(invoke(&[Syscall::Create as u32, name, 16]), 1);
        // A second create with the same name fails.
        assert_eq!(invoke(&[Syscall::Create as u32, name, 16]), 0);

        let fd = invoke(&[Syscall::Open as u32, name]);
        assert_eq!(fd, 2);
        assert_eq!(invoke(&[Syscall::Filesize as u32, fd as u32]), 16);

        let data = SCRATCH + 32;
        usermem::user_store(data, b"abcd");
        assert_eq!(invoke(&[Syscall::Write as u32, fd as u32, data as u32, 4]), 4);
        assert_eq!(invoke(&[Syscall::Tell as u32, fd as u32]), 4);

        assert_eq!(invoke(&[Syscall::Seek as u32, fd as u32, 0]), 0);
        let readback = SCRATCH + 64;
        assert_eq!(
            invoke(&[Syscall::Read as u32, fd as u32, readback as u32, 4]),
            4
        );
        let mut buf = [0u8; 4];
        usermem::user_load(readback, &mut buf);
        assert_eq!(&buf, b"abcd");

        assert_eq!(invoke(&[Syscall::Close as u32, fd as u32]), 0);
        // The descriptor is gone.
        assert_eq!(invoke(&[Syscall::Tell as u32, fd as u32]), -1);

        assert_eq!(invoke(&[Syscall::Remove as u32, name]), 1);
        assert_eq!(invoke(&[Syscall::Open as u32, name]), -1);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn test_bad_buffer_kills_process() {
    let _kernel = boot();

    let status = process::run_user("bad-buf", || {
        usermem::set_esp(ESP);
        // Far from the stack and never mapped.
        invoke(&[Syscall::Write as u32, 1, 0x5000_0000, 4]);
        unreachable!("the syscall must terminate the process");
    });
    assert_eq!(status, -1);
}

#[test]
fn test_bad_fd_is_an_error_not_a_kill() {
    let _kernel = boot();

    let status = process::run_user("bad-fd", || {
        usermem::set_esp(ESP);
        usermem::user_store(SCRATCH, b"x");
        // The call returns -1 instead of killing the process.
        assert_eq!(invoke(&[Syscall::Write as u32, 9, SCRATCH as u32, 1]), -1);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn test_exit_status_propagates() {
    let _kernel = boot();

    let status = process::run_user("exiter", || {
        invoke(&[Syscall::Exit as u32, 42]);
        unreachable!("exit does not return");
    });
    assert_eq!(status, 42);
}

#[test]
fn test_exec_and_wait() {
    let kernel = boot();
    process::register_program(&kernel, "seven", || 7);

    let status = process::run_user("parent", || {
        let cmd = place_str(SCRATCH, "seven");
        let child = invoke(&[Syscall::Exec as u32, cmd]);
        assert!(child > 0);
        invoke(&[Syscall::Wait as u32, child as u32])
    });
    assert_eq!(status, 7);
}

#[test]
fn test_exec_unknown_program_fails() {
    let _kernel = boot();

    let status = process::run_user("parent", || {
        let cmd = place_str(SCRATCH, "no-such-program");
        invoke(&[Syscall::Exec as u32, cmd])
    });
    assert_eq!(status, -1);
}

#[test]
fn test_wait_on_non_child_fails() {
    let _kernel = boot();

    let status = process::run_user("loner", || invoke(&[Syscall::Wait as u32, 9999]));
    assert_eq!(status, -1);
}

#[test]
fn test_wait_twice_fails_the_second_time() {
    let kernel = boot();
    process::register_program(&kernel, "quick", || 3);

    let status = process::run_user("parent", || {
        let cmd = place_str(SCRATCH, "quick");
        let child = invoke(&[Syscall::Exec as u32, cmd]);
        let first = invoke(&[Syscall::Wait as u32, child as u32]);
        let second = invoke(&[Syscall::Wait as u32, child as u32]);
        assert_eq!(first, 3);
        assert_eq!(second, -1);
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn test_halt_marks_kernel_halted() {
    let kernel = boot();

    let status = process::run_user("halter", || {
        invoke(&[Syscall::Halt as u32]);
        unreachable!("halt does not return");
    });
    assert_eq!(status, 0);
    assert!(kernel.is_halted());
}

#[test]
fn test_mmap_munmap_syscalls() {
    let kernel = boot();

    let content = b"ABCDEFGH";
    kernel.fs().create("m", content.len()).unwrap();
    kernel.fs().open("m").unwrap().write(content);

    let map_va: usize = 0x2000_0000;
    let status = process::run_user("mapper", move || {
        let name = place_str(SCRATCH, "m");
        let fd = invoke(&[Syscall::Open as u32, name]);
        assert!(fd >= 2);

        let mapid = invoke(&[Syscall::Mmap as u32, fd as u32, map_va as u32]);
        assert!(mapid >= 0);

        // Mapping a range that is now occupied fails.
        assert_eq!(invoke(&[Syscall::Mmap as u32, fd as u32, map_va as u32]), -1);

        let mut view = [0u8; 8];
        usermem::user_load(map_va, &mut view);
        assert_eq!(&view, b"ABCDEFGH");

        usermem::user_store(map_va, b"WXYZ");
        assert_eq!(invoke(&[Syscall::Munmap as u32, mapid as u32]), 0);
        assert_eq!(invoke(&[Syscall::Close as u32, fd as u32]), 0);
        0
    });
    assert_eq!(status, 0);

    let file = kernel.fs().open("m").unwrap();
    let mut buf = [0u8; 8];
    file.read(&mut buf);
    assert_eq!(&buf, b"WXYZEFGH");
}

#[test]
fn test_mmap_empty_file_fails() {
    let kernel = boot();
    kernel.fs().create("empty", 0).unwrap();

    let status = process::run_user("mapper", || {
        let name = place_str(SCRATCH, "empty");
        let fd = invoke(&[Syscall::Open as u32, name]);
        invoke(&[Syscall::Mmap as u32, fd as u32, 0x2000_0000])
    });
    assert_eq!(status, -1);
}

#[test]
fn test_user_pages_survive_syscall_buffer_pinning() {
    // A buffer spanning two pages, the second only reachable by stack
    // growth at validation time.
    let _kernel = boot();

    let status = process::run_user("spanner", || {
        let esp = PHYS_BASE - 2 * PGSIZE + 64;
        usermem::set_esp(esp);
        // 64 bytes in the stack page, 64 in the page above it.
        let buf = PHYS_BASE - PGSIZE - 64;
        usermem::user_store(buf, &[b'x'; 128]);

        for (i, word) in [Syscall::Write as u32, 1, buf as u32, 128]
            .iter()
            .enumerate()
        {
            usermem::user_store(esp + 4 * i, &word.to_le_bytes());
        }
        syscall::dispatch(&IntrFrame { esp })
    });
    assert_eq!(status, 128);
}
