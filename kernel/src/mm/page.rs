//! Page descriptors.
//!
//! Every user page is described by a [`Page`]: an immutable virtual
//! address and writability, a pin count, an optional resident frame,
//! and a tagged variant. Pages are born uninitialized and promote to
//! their real variant (anonymous or file-backed) on first claim;
//! the variant then supplies `swap_in`, `swap_out`, and `destroy`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use super::file_page::MmapRegion;
use super::frame::Frame;
use super::palloc::Kva;
use super::spt::SupplementalPageTable;
use super::{anon, file_page, pg_ofs};
use crate::fs::File;
use crate::kernel::Kernel;

/// How an anonymous page obtains its first contents.
#[derive(Clone)]
pub enum AnonInit {
    /// Zero-filled (stack growth, bss).
    Zero,
    /// Lazily loaded from an executable segment.
    Segment(SegmentSource),
}

/// Byte range of a file backing a lazily loaded segment page.
#[derive(Clone)]
pub struct SegmentSource {
    pub file: Arc<File>,
    pub offset: usize,
    /// Bytes read from the file; the rest of the page is zero.
    pub read_bytes: usize,
}

/// Anonymous-page state.
pub(crate) struct AnonState {
    pub init: AnonInit,
    /// Swap slot holding the evicted contents, if any.
    pub slot: Option<usize>,
    /// Set once a swap-out ever observed the page dirty; a clean
    /// segment page keeps re-loading from its file instead of
    /// consuming swap.
    pub dirty_sticky: bool,
}

impl AnonState {
    /// Clean lazy-segment pages are re-satisfied by their loader.
    pub fn is_lazy_clean(&self) -> bool {
        matches!(self.init, AnonInit::Segment(_)) && !self.dirty_sticky
    }
}

/// The tagged variant.
pub(crate) enum PageKind {
    /// Created, never claimed; promotes on first fault.
    UninitAnon { init: AnonInit },
    UninitFile { region: Arc<MmapRegion> },
    Anon(AnonState),
    File { region: Arc<MmapRegion> },
}

/// One user page.
pub struct Page {
    va: usize,
    writable: bool,
    spt: Weak<SupplementalPageTable>,
    pub(crate) frame: SpinMutex<Option<Arc<Frame>>>,
    pin_count: AtomicU32,
    pub(crate) kind: SpinMutex<PageKind>,
}

impl Page {
    pub(crate) fn new_anon(
        spt: &Arc<SupplementalPageTable>,
        va: usize,
        writable: bool,
        init: AnonInit,
    ) -> Arc<Page> {
        assert_eq!(pg_ofs(va), 0);
        Arc::new(Page {
            va,
            writable,
            spt: Arc::downgrade(spt),
            frame: SpinMutex::new(None),
            pin_count: AtomicU32::new(0),
            kind: SpinMutex::new(PageKind::UninitAnon { init }),
        })
    }

    pub(crate) fn new_file(
        spt: &Arc<SupplementalPageTable>,
        va: usize,
        writable: bool,
        region: Arc<MmapRegion>,
    ) -> Arc<Page> {
        assert_eq!(pg_ofs(va), 0);
        Arc::new(Page {
            va,
            writable,
            spt: Arc::downgrade(spt),
            frame: SpinMutex::new(None),
            pin_count: AtomicU32::new(0),
            kind: SpinMutex::new(PageKind::UninitFile { region }),
        })
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn spt(&self) -> Arc<SupplementalPageTable> {
        self.spt.upgrade().expect("page outlived its page table")
    }

    pub(crate) fn spt_is_raw(&self, spt: &SupplementalPageTable) -> bool {
        std::ptr::eq(self.spt.as_ptr(), spt)
    }

    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().clone()
    }

    pub(crate) fn set_frame(&self, frame: Option<Arc<Frame>>) {
        *self.frame.lock() = frame;
    }

    pub fn is_resident(&self) -> bool {
        self.frame.lock().is_some()
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of an unpinned page");
    }

    /// Whether this page ever promoted to the anonymous variant and
    /// currently names a swap slot.
    pub fn swap_slot(&self) -> Option<usize> {
        match &*self.kind.lock() {
            PageKind::Anon(state) => state.slot,
            _ => None,
        }
    }

    /// Promote an uninitialized page to its target variant. Idempotent
    /// for already-promoted pages.
    fn promote(&self) {
        let mut kind = self.kind.lock();
        match &*kind {
            PageKind::UninitAnon { init } => {
                *kind = PageKind::Anon(AnonState {
                    init: init.clone(),
                    slot: None,
                    dirty_sticky: false,
                });
            }
            PageKind::UninitFile { region } => {
                *kind = PageKind::File {
                    region: region.clone(),
                };
            }
            PageKind::Anon(_) | PageKind::File { .. } => {}
        }
    }

    /// Fill the freshly mapped frame at `kva` with this page's
    /// contents: loader, swap slot, zeroes, or file bytes, by variant.
    pub(crate) fn swap_in(&self, kernel: &Arc<Kernel>, kva: Kva) -> bool {
        self.promote();
        let region = {
            let kind = self.kind.lock();
            match &*kind {
                PageKind::Anon(_) => None,
                PageKind::File { region } => Some(region.clone()),
                PageKind::UninitAnon { .. } | PageKind::UninitFile { .. } => unreachable!(),
            }
        };
        match region {
            None => anon::swap_in(kernel, self, kva),
            Some(region) => file_page::swap_in(kernel, self, &region, kva),
        }
    }

    /// Save the resident contents to this page's backing store: swap
    /// for anonymous pages, the mapped file for file pages (dirty
    /// only). Returns false if the backing store rejected the write.
    pub(crate) fn swap_out(&self, kernel: &Arc<Kernel>) -> bool {
        let region = {
            let kind = self.kind.lock();
            match &*kind {
                PageKind::Anon(_) => None,
                PageKind::File { region } => Some(region.clone()),
                PageKind::UninitAnon { .. } | PageKind::UninitFile { .. } => {
                    unreachable!("swap_out of an unclaimed page")
                }
            }
        };
        match region {
            None => anon::swap_out(kernel, self),
            Some(region) => file_page::swap_out(kernel, self, &region),
        }
    }

    /// Tear the page down: free its swap slot, write back dirty file
    /// contents, clear its mapping, and return its frame to the pool.
    /// The caller must have already unlinked any frame from the global
    /// frame table.
    pub(crate) fn destroy(&self, kernel: &Arc<Kernel>) {
        let region = {
            let kind = self.kind.lock();
            match &*kind {
                PageKind::File { region } | PageKind::UninitFile { region } => {
                    Some(region.clone())
                }
                PageKind::Anon(_) | PageKind::UninitAnon { .. } => None,
            }
        };
        match region {
            None => anon::destroy(kernel, self),
            Some(region) => file_page::destroy(kernel, self, &region),
        }
    }
}
