//! File-backed pages and mmap regions.
//!
//! A page's contents occupy a byte range of the mapped file at
//! `region.offset + (va - region.start)`; the final page of a region
//! that is not a page multiple is part file, part zero. The file is
//! the backing store: eviction writes dirty pages back to it and no
//! swap slot is ever involved.

use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use super::page::Page;
use super::palloc::Kva;
use super::spt::SupplementalPageTable;
use super::{is_user_vaddr, pg_ofs, PGSIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::kernel::Kernel;

/// One contiguous virtual range backed by bytes of one file: the unit
/// of mapping and unmapping.
pub struct MmapRegion {
    pub mapid: i32,
    pub(crate) file: File,
    pub start: usize,
    pub len: usize,
    pub offset: usize,
    pub writable: bool,
    /// The region's pages; owned by the SPT, referenced here for
    /// unmapping.
    pub(crate) pages: SpinMutex<Vec<Weak<Page>>>,
}

impl MmapRegion {
    /// Byte range `(file_offset, len)` of this file backing `va`.
    fn byte_range(&self, va: usize) -> (usize, usize) {
        let start_off = self.offset + (va - self.start);
        let len = PGSIZE.min(self.offset + self.len - start_off);
        assert!(len > 0, "page outside its mmap region");
        (start_off, len)
    }
}

/// Read the page's byte range from the file, zero the tail, and start
/// with a clean PTE.
pub(crate) fn swap_in(
    kernel: &Arc<Kernel>,
    page: &Page,
    region: &Arc<MmapRegion>,
    kva: Kva,
) -> bool {
    let (offset, len) = region.byte_range(page.va());

    let held = kernel.fs.is_held();
    if !held {
        kernel.fs.lock().acquire();
    }
    region.file.seek(offset);
    let read = kernel.palloc.with_frame(kva, |buf| {
        let n = region.file.read(&mut buf[..len]);
        buf[len..].fill(0);
        n
    });
    if !held {
        kernel.fs.lock().release();
    }
    if read != len {
        return false;
    }

    page.spt().pagedir.set_dirty(page.va(), false);
    true
}

/// Write the page back to its file range, but only if the PTE says it
/// was written to.
pub(crate) fn swap_out(kernel: &Arc<Kernel>, page: &Page, region: &Arc<MmapRegion>) -> bool {
    let spt = page.spt();
    if !spt.pagedir.is_dirty(page.va()) {
        return true;
    }

    let kva = page.frame().expect("writeback of a non-resident page").kva;
    let (offset, len) = region.byte_range(page.va());
    let bytes = kernel.palloc.with_frame(kva, |buf| buf[..len].to_vec());

    let held = kernel.fs.is_held();
    if !held {
        kernel.fs.lock().acquire();
    }
    region.file.seek(offset);
    let written = region.file.write(&bytes);
    if !held {
        kernel.fs.lock().release();
    }

    written == len
}

/// Destroy behaves as writeback followed by unmapping and frame free.
pub(crate) fn destroy(kernel: &Arc<Kernel>, page: &Page, region: &Arc<MmapRegion>) {
    if page.frame().is_none() {
        return;
    }

    swap_out(kernel, page, region);

    let frame = page.frame.lock().take().expect("frame vanished");
    page.spt().pagedir.clear_page(page.va());
    kernel.palloc.free_page(frame.kva);
}

/// Map `length` bytes of `file` starting at `offset` into the address
/// space at `addr`. Every page of the range must be unmapped. Returns
/// the fresh region's mapid.
pub fn do_mmap(
    spt: &Arc<SupplementalPageTable>,
    addr: usize,
    length: usize,
    writable: bool,
    file: &File,
    offset: usize,
) -> KernelResult<i32> {
    if addr == 0 || pg_ofs(addr) != 0 {
        return Err(KernelError::InvalidAddress { addr });
    }
    if length == 0 {
        return Err(KernelError::InvalidArgument { name: "length" });
    }
    let end = addr
        .checked_add(length)
        .ok_or(KernelError::InvalidAddress { addr })?;
    if !is_user_vaddr(addr) || !is_user_vaddr(end - 1) {
        return Err(KernelError::InvalidAddress { addr });
    }
    for va in (addr..end).step_by(PGSIZE) {
        if spt.find(va).is_some() {
            return Err(KernelError::AlreadyMapped { addr: va });
        }
    }

    let mapid = spt.allocate_mapid();
    let region = Arc::new(MmapRegion {
        mapid,
        file: file.reopen(),
        start: addr,
        len: length,
        offset,
        writable,
        pages: SpinMutex::new(Vec::new()),
    });
    spt.add_region(region.clone());

    for va in (addr..end).step_by(PGSIZE) {
        let page = Page::new_file(spt, va, writable, region.clone());
        if let Err(err) = spt.insert(page.clone()) {
            // Tear down whatever was installed and surface the error.
            let _ = do_munmap(spt, mapid);
            return Err(err);
        }
        region.pages.lock().push(Arc::downgrade(&page));
    }

    log::debug!(
        "[MMAP] mapid {} covers {:#x}..{:#x} (len {})",
        mapid,
        addr,
        end,
        length
    );
    Ok(mapid)
}

/// Unmap a region: destroy every descriptor (writing dirty pages
/// back), then close the region's file handle.
pub fn do_munmap(spt: &Arc<SupplementalPageTable>, mapid: i32) -> KernelResult<()> {
    let region = spt.take_region(mapid).ok_or(KernelError::BadMapId { mapid })?;

    spt.lock.acquire();
    let pages: Vec<Weak<Page>> = region.pages.lock().drain(..).collect();
    for page in pages.iter().filter_map(Weak::upgrade) {
        spt.remove(&page);
    }
    spt.lock.release();

    // Dropping the region closes the reopened file handle.
    log::debug!("[MMAP] unmapped mapid {}", mapid);
    Ok(())
}
