//! User-memory access.
//!
//! Every kernel touch of user memory goes through here: addresses are
//! translated through the faulting thread's page directory the way the
//! MMU would, misses are delivered to the VM fault handler, and
//! successful accesses set the accessed/dirty bits. Syscalls that take
//! user buffers first validate the whole range and pin its pages so
//! eviction cannot pull a buffer out from under the I/O.

use std::sync::Arc;

use super::IntrFrame;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::frame::{vm_page_exist, vm_pin_page, vm_try_handle_fault, vm_unpin_page};
use crate::mm::spt::SupplementalPageTable;
use crate::mm::{is_user_vaddr, pg_ofs, pg_round_down, PGSIZE};
use crate::sched::thread;

/// Longest string argument a syscall accepts.
pub const MAX_ARGS_LEN: usize = 128;

/// Record the simulated user stack pointer for the current thread;
/// faults and syscalls read it from the trap frame.
pub fn set_esp(esp: usize) {
    thread::current()
        .user_esp
        .store(esp, std::sync::atomic::Ordering::Release);
}

/// The current thread's trap frame, as the fault path sees it.
pub fn current_frame() -> IntrFrame {
    IntrFrame {
        esp: thread::current()
            .user_esp
            .load(std::sync::atomic::Ordering::Acquire),
    }
}

fn current_spt() -> Arc<SupplementalPageTable> {
    thread::current().user_space().spt.clone()
}

/// Translate the page under `addr`, faulting it in if needed. The
/// exact byte address feeds the fault handler's stack-growth
/// heuristic. Marks the access in the page directory on success.
fn translate(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    addr: usize,
    write: bool,
) -> KernelResult<crate::mm::palloc::Kva> {
    let spt = current_spt();
    let page_va = pg_round_down(addr);

    if spt.pagedir.get_page(page_va).is_none()
        && !vm_try_handle_fault(kernel, frame, addr, true, write, true)
    {
        return Err(KernelError::NotMapped { addr: page_va });
    }
    if write && !spt.pagedir.is_writable(page_va) {
        // Protection violation: the fault handler rejects these.
        return Err(KernelError::ReadOnly { addr: page_va });
    }

    let kva = spt
        .pagedir
        .get_page(page_va)
        .ok_or(KernelError::NotMapped { addr: page_va })?;
    spt.pagedir.mark_access(page_va, write);
    Ok(kva)
}

/// Read `buf.len()` bytes of user memory at `va`.
pub fn read_bytes_at(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    va: usize,
    buf: &mut [u8],
) -> KernelResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let end = va
        .checked_add(buf.len())
        .filter(|&e| is_user_vaddr(e - 1) && is_user_vaddr(va))
        .ok_or(KernelError::InvalidAddress { addr: va })?;

    let mut cursor = va;
    let mut copied = 0;
    while cursor < end {
        let offset = pg_ofs(cursor);
        let chunk = (PGSIZE - offset).min(end - cursor);
        let kva = translate(kernel, frame, cursor, false)?;
        kernel.palloc.with_frame(kva, |bytes| {
            buf[copied..copied + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
        });
        cursor += chunk;
        copied += chunk;
    }
    Ok(())
}

/// Write `buf` into user memory at `va`.
pub fn write_bytes_at(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    va: usize,
    buf: &[u8],
) -> KernelResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let end = va
        .checked_add(buf.len())
        .filter(|&e| is_user_vaddr(e - 1) && is_user_vaddr(va))
        .ok_or(KernelError::InvalidAddress { addr: va })?;

    let mut cursor = va;
    let mut copied = 0;
    while cursor < end {
        let offset = pg_ofs(cursor);
        let chunk = (PGSIZE - offset).min(end - cursor);
        let kva = translate(kernel, frame, cursor, true)?;
        kernel.palloc.with_frame(kva, |bytes| {
            bytes[offset..offset + chunk].copy_from_slice(&buf[copied..copied + chunk]);
        });
        cursor += chunk;
        copied += chunk;
    }
    Ok(())
}

/// Read user memory at `va` on behalf of the current thread, using
/// its recorded stack pointer for the fault heuristic.
pub fn read_user(va: usize, buf: &mut [u8]) -> KernelResult<()> {
    let kernel = thread::current().kernel();
    let frame = current_frame();
    read_bytes_at(&kernel, &frame, va, buf)
}

/// Write user memory at `va` on behalf of the current thread.
pub fn write_user(va: usize, buf: &[u8]) -> KernelResult<()> {
    let kernel = thread::current().kernel();
    let frame = current_frame();
    write_bytes_at(&kernel, &frame, va, buf)
}

/// Read one little-endian 32-bit word of user memory.
pub fn read_u32(kernel: &Arc<Kernel>, frame: &IntrFrame, va: usize) -> KernelResult<u32> {
    let mut buf = [0u8; 4];
    read_bytes_at(kernel, frame, va, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a NUL-terminated user string of at most `max` bytes.
pub fn read_cstr(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    va: usize,
    max: usize,
) -> KernelResult<String> {
    let mut out = Vec::new();
    for i in 0..max {
        let mut byte = [0u8; 1];
        read_bytes_at(kernel, frame, va + i, &mut byte)?;
        if byte[0] == 0 {
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.push(byte[0]);
    }
    Err(KernelError::InvalidArgument { name: "string too long" })
}

/// A user-mode store: what a `mov` from ring 3 does. An unresolvable
/// fault terminates the process with status -1 instead of returning.
pub fn user_store(va: usize, buf: &[u8]) {
    if write_user(va, buf).is_err() {
        thread::exit_with_status(-1);
    }
}

/// A user-mode load; an unresolvable fault terminates the process
/// with status -1.
pub fn user_load(va: usize, buf: &mut [u8]) {
    if read_user(va, buf).is_err() {
        thread::exit_with_status(-1);
    }
}

/// Pages pinned for the duration of a syscall; unpinned on drop.
pub struct PinGuard {
    spt: Arc<SupplementalPageTable>,
    pages: Vec<usize>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        for &va in &self.pages {
            vm_unpin_page(&self.spt, va);
        }
    }
}

/// Validate a user buffer: every page present in the SPT (or created
/// by stack growth) and writable where required. The pages are pinned
/// against eviction for the duration of the returned guard.
pub fn check_and_pin(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    va: usize,
    len: usize,
    writable: bool,
) -> KernelResult<PinGuard> {
    let end = va
        .checked_add(len.max(1))
        .filter(|&e| is_user_vaddr(e - 1) && is_user_vaddr(va) && va != 0)
        .ok_or(KernelError::InvalidAddress { addr: va })?;

    let spt = current_spt();
    let first = pg_round_down(va);
    let mut guard = PinGuard {
        spt: spt.clone(),
        pages: Vec::new(),
    };
    for page_va in (first..end).step_by(PGSIZE) {
        if !vm_page_exist(kernel, &spt, page_va, writable, frame) {
            return Err(KernelError::NotMapped { addr: page_va });
        }
        if !vm_pin_page(kernel, &spt, page_va) {
            return Err(KernelError::NotMapped { addr: page_va });
        }
        guard.pages.push(page_va);
    }
    Ok(guard)
}
