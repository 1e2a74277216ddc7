//! Supplemental page table: the per-address-space map from virtual
//! page to page descriptor, shadowing the hardware page table with
//! lazy-load metadata.
//!
//! One kernel lock protects the table against eviction from other
//! threads; eviction only ever try-acquires it, which is what breaks
//! the cycle with threads that call into the frame subsystem while
//! holding their own table.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use super::file_page::MmapRegion;
use super::page::{AnonInit, Page};
use super::pagedir::PageDir;
use super::pg_ofs;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sched::thread::Tcb;
use crate::sync::Lock;

struct SptInner {
    pages: BTreeMap<usize, Arc<Page>>,
    regions: Vec<Arc<MmapRegion>>,
    next_mapid: i32,
}

/// Per-address-space page table supplement.
pub struct SupplementalPageTable {
    kernel: Weak<Kernel>,
    /// The owning thread, for diagnostics.
    thread: Weak<Tcb>,
    /// The hardware-table stand-in for this address space.
    pub pagedir: Arc<PageDir>,
    /// Guards the maps and every page lifecycle operation against
    /// eviction.
    pub lock: Lock,
    inner: SpinMutex<SptInner>,
}

impl SupplementalPageTable {
    pub(crate) fn new(kernel: &Arc<Kernel>, thread: Weak<Tcb>) -> Arc<Self> {
        Arc::new(Self {
            kernel: Arc::downgrade(kernel),
            thread,
            pagedir: Arc::new(PageDir::new()),
            lock: Lock::new(),
            inner: SpinMutex::new(SptInner {
                pages: BTreeMap::new(),
                regions: Vec::new(),
                next_mapid: 0,
            }),
        })
    }

    pub(crate) fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel torn down under SPT")
    }

    pub(crate) fn thread_name(&self) -> String {
        self.thread
            .upgrade()
            .map(|t| t.name().to_owned())
            .unwrap_or_else(|| "<exited>".to_owned())
    }

    /// Look up the descriptor covering page `va`.
    pub fn find(&self, va: usize) -> Option<Arc<Page>> {
        assert_eq!(pg_ofs(va), 0);
        self.inner.lock().pages.get(&va).cloned()
    }

    /// Install a descriptor; fails if its address is taken.
    pub(crate) fn insert(&self, page: Arc<Page>) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let va = page.va();
        if inner.pages.contains_key(&va) {
            return Err(KernelError::AlreadyMapped { addr: va });
        }
        inner.pages.insert(va, page);
        Ok(())
    }

    /// Create an uninitialized anonymous page at `va`.
    pub fn alloc_anon(
        self: &Arc<Self>,
        va: usize,
        writable: bool,
        init: AnonInit,
    ) -> KernelResult<Arc<Page>> {
        let page = Page::new_anon(self, va, writable, init);
        self.insert(page.clone())?;
        Ok(page)
    }

    /// Remove and destroy one descriptor. The caller must hold the
    /// SPT lock; a resident page's frame is first unlinked from the
    /// global frame table.
    pub(crate) fn remove(&self, page: &Arc<Page>) {
        assert!(self.lock.held_by_current_thread(), "SPT lock not held");
        let kernel = self.kernel();

        if let Some(frame) = page.frame() {
            kernel.frames.unlink(&frame);
        }
        page.destroy(&kernel);
        self.inner.lock().pages.remove(&page.va());
    }

    /// Tear the whole table down: unlink every resident frame from the
    /// global frame table, then destroy every descriptor (writing
    /// dirty file pages back) and release the mmap regions.
    pub fn kill(&self) {
        let kernel = self.kernel();
        log::debug!("[VM] killing page table of '{}'", self.thread_name());

        self.lock.acquire();
        kernel.frames.unlink_all_of(self);
        self.lock.release();

        let (pages, regions) = {
            let mut inner = self.inner.lock();
            let pages: Vec<Arc<Page>> = std::mem::take(&mut inner.pages).into_values().collect();
            let regions = std::mem::take(&mut inner.regions);
            (pages, regions)
        };
        for page in &pages {
            page.destroy(&kernel);
        }
        // Dropping the regions closes their reopened file handles.
        drop(regions);
    }

    pub(crate) fn allocate_mapid(&self) -> i32 {
        let mut inner = self.inner.lock();
        let mapid = inner.next_mapid;
        inner.next_mapid += 1;
        mapid
    }

    pub(crate) fn add_region(&self, region: Arc<MmapRegion>) {
        self.inner.lock().regions.push(region);
    }

    /// Detach a region from the table by mapid.
    pub(crate) fn take_region(&self, mapid: i32) -> Option<Arc<MmapRegion>> {
        let mut inner = self.inner.lock();
        let pos = inner.regions.iter().position(|r| r.mapid == mapid)?;
        Some(inner.regions.remove(pos))
    }

    /// Number of live descriptors.
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Number of live mmap regions.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }
}
