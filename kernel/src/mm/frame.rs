//! Physical frames: the global frame table, eviction, page claiming,
//! and the page-fault path.
//!
//! Resident frames live on one global list guarded by `frame_lock`.
//! Eviction scans it for a non-pinned victim whose SPT lock can be
//! taken without waiting; lock order is always frame_lock before SPT
//! lock (try-only), and frame_lock is never held across I/O.

use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use super::page::{AnonInit, Page};
use super::palloc::Kva;
use super::spt::SupplementalPageTable;
use super::{is_user_vaddr, pg_round_down, PHYS_BASE, STACK_SLACK, USR_STACK_MAX};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sched::thread;
use crate::sync::Lock;
use crate::timer;
use crate::userprog::IntrFrame;

/// Eviction retries before giving up on an all-pinned frame table.
const EVICT_RETRIES: usize = 6;

/// One physical frame of user memory.
pub struct Frame {
    pub kva: Kva,
    /// The resident page, cleared while the frame is in transit.
    pub(crate) page: SpinMutex<Weak<Page>>,
}

impl Frame {
    fn new(kva: Kva) -> Arc<Frame> {
        Arc::new(Frame {
            kva,
            page: SpinMutex::new(Weak::new()),
        })
    }
}

/// The global table of resident frames.
pub struct FrameTable {
    /// `frame_lock`: serializes table membership.
    lock: Lock,
    list: SpinMutex<Vec<Arc<Frame>>>,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        Self {
            lock: Lock::new(),
            list: SpinMutex::new(Vec::new()),
        }
    }

    /// Number of resident frames.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Link a frame into the table, making it visible to eviction.
    pub(crate) fn link(&self, frame: Arc<Frame>) {
        self.lock.acquire();
        self.list.lock().push(frame);
        self.lock.release();
    }

    /// Unlink a specific frame (its page is being destroyed).
    pub(crate) fn unlink(&self, frame: &Arc<Frame>) {
        self.lock.acquire();
        self.list.lock().retain(|f| !Arc::ptr_eq(f, frame));
        self.lock.release();
    }

    /// Unlink every frame whose page belongs to `spt`.
    pub(crate) fn unlink_all_of(&self, spt: &SupplementalPageTable) {
        self.lock.acquire();
        self.list.lock().retain(|f| {
            f.page
                .lock()
                .upgrade()
                .map(|p| !p.spt_is_raw(spt))
                .unwrap_or(false)
        });
        self.lock.release();
    }

    /// Scan for an evictable victim: resident, pin count zero, and its
    /// SPT lock available without waiting. On success the frame is
    /// unlinked and the victim's SPT lock is held by the caller.
    fn get_victim(&self) -> Option<(Arc<Frame>, Arc<Page>)> {
        self.lock.acquire();
        let mut victim = None;
        {
            let mut list = self.list.lock();
            let mut found = None;
            for (i, frame) in list.iter().enumerate() {
                let page = match frame.page.lock().upgrade() {
                    Some(page) => page,
                    None => continue,
                };
                if page.pin_count() != 0 {
                    continue;
                }
                let spt = page.spt();
                if spt.lock.held_by_current_thread() || !spt.lock.try_acquire() {
                    continue;
                }
                found = Some((i, page));
                break;
            }
            if let Some((i, page)) = found {
                victim = Some((list.remove(i), page));
            }
        }
        self.lock.release();
        victim
    }
}

/// Get a frame for a page about to become resident: from the pool if
/// physical memory is available, otherwise by evicting a victim.
pub(crate) fn vm_get_frame(kernel: &Arc<Kernel>) -> KernelResult<Arc<Frame>> {
    if let Some(kva) = kernel.palloc.get_page() {
        return Ok(Frame::new(kva));
    }
    vm_evict_frame(kernel)
}

/// Evict some resident page and hand its frame to the caller, already
/// cleared. Retries with a short ascending backoff when every frame is
/// pinned or the backing store rejects the write.
fn vm_evict_frame(kernel: &Arc<Kernel>) -> KernelResult<Arc<Frame>> {
    for attempt in 0..=EVICT_RETRIES {
        if attempt > 0 {
            timer::msleep(5 + 3 * (attempt as u64 - 1));
        }
        let (frame, page) = match kernel.frames.get_victim() {
            Some(victim) => victim,
            None => continue,
        };
        // The victim's SPT lock is held from here.
        let spt = page.spt();

        if !page.swap_out(kernel) {
            // Re-park the victim and retry.
            log::warn!("[VM] swap-out failed; re-parking frame {:?}", frame.kva);
            kernel.frames.link(frame);
            spt.lock.release();
            continue;
        }

        spt.pagedir.clear_page(page.va());
        page.set_frame(None);
        *frame.page.lock() = Weak::new();
        spt.lock.release();

        kernel.palloc.with_frame(frame.kva, |buf| buf.fill(0));
        log::trace!("[VM] evicted page {:#x} of '{}'", page.va(), spt.thread_name());
        return Ok(frame);
    }
    Err(KernelError::NoEvictableFrame)
}

/// Bind `page` to a fresh frame, install its mapping, load its
/// contents, and publish the frame to the eviction scan.
///
/// The PTE goes in before the contents load so a concurrent fault on
/// the same address observes progress, but the frame is linked into
/// the table only afterwards, so eviction cannot target a page that is
/// still loading.
pub fn vm_do_claim_page(kernel: &Arc<Kernel>, page: &Arc<Page>) -> KernelResult<()> {
    let frame = vm_get_frame(kernel)?;
    *frame.page.lock() = Arc::downgrade(page);
    page.set_frame(Some(frame.clone()));

    let spt = page.spt();
    spt.lock.acquire();
    assert!(
        spt.pagedir.get_page(page.va()).is_none(),
        "claiming an already-mapped page"
    );
    spt.pagedir.set_page(page.va(), frame.kva, page.writable());
    spt.lock.release();

    let loaded = page.swap_in(kernel, frame.kva);

    spt.lock.acquire();
    spt.pagedir.set_accessed(page.va(), false);
    spt.pagedir.set_dirty(page.va(), false);
    kernel.frames.link(frame);
    spt.lock.release();

    if loaded {
        Ok(())
    } else {
        Err(KernelError::InvalidAddress { addr: page.va() })
    }
}

/// Allocate and immediately claim a zero-filled anonymous page.
pub fn vm_claim_zero_page(
    kernel: &Arc<Kernel>,
    spt: &Arc<SupplementalPageTable>,
    va: usize,
    writable: bool,
) -> KernelResult<()> {
    let page = spt.alloc_anon(pg_round_down(va), writable, AnonInit::Zero)?;
    vm_do_claim_page(kernel, &page)
}

/// Whether a miss at `addr` qualifies as stack growth: a user access
/// within [`STACK_SLACK`] bytes below the stack pointer and inside the
/// stack limit.
fn is_stack_growth(esp: usize, addr: usize, user: bool, not_present: bool) -> bool {
    user && not_present
        && is_user_vaddr(addr)
        && addr + STACK_SLACK >= esp
        && addr >= PHYS_BASE - USR_STACK_MAX
}

/// Grow the stack by one zero page at `addr`'s page.
fn vm_stack_growth(
    kernel: &Arc<Kernel>,
    spt: &Arc<SupplementalPageTable>,
    addr: usize,
) -> KernelResult<()> {
    log::trace!("[VM] stack growth to {:#x}", pg_round_down(addr));
    vm_claim_zero_page(kernel, spt, addr, true)
}

/// The page-fault handler. Returns true if the fault was resolved;
/// a false return is a programming error that the syscall path
/// translates into process termination.
pub fn vm_try_handle_fault(
    kernel: &Arc<Kernel>,
    frame: &IntrFrame,
    addr: usize,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    let _ = write;
    if !not_present {
        // Protection fault: never recoverable.
        return false;
    }

    let cur = thread::current();
    let spt = cur.user_space().spt.clone();
    let va = pg_round_down(addr);

    match spt.find(va) {
        Some(page) => {
            assert!(page.frame().is_none(), "fault on a resident page");
            vm_do_claim_page(kernel, &page).is_ok()
        }
        None => {
            if is_stack_growth(frame.esp, addr, user, not_present) {
                vm_stack_growth(kernel, &spt, addr).is_ok()
            } else {
                false
            }
        }
    }
}

/// Whether a page covering `va` exists (or can be created by stack
/// growth) with the required writability.
pub fn vm_page_exist(
    kernel: &Arc<Kernel>,
    spt: &Arc<SupplementalPageTable>,
    va: usize,
    writable: bool,
    frame: &IntrFrame,
) -> bool {
    match spt.find(va) {
        Some(page) => page.writable() || !writable,
        None => {
            if is_stack_growth(frame.esp, va, true, true) {
                vm_stack_growth(kernel, spt, va).is_ok()
            } else {
                false
            }
        }
    }
}

/// Pin the page at `va`, claiming it first if it is not resident.
/// While pinned it is invisible to eviction.
pub fn vm_pin_page(kernel: &Arc<Kernel>, spt: &Arc<SupplementalPageTable>, va: usize) -> bool {
    let page = match spt.find(va) {
        Some(page) => page,
        None => return false,
    };

    spt.lock.acquire();
    page.pin();
    spt.lock.release();

    if page.frame().is_none() {
        return vm_do_claim_page(kernel, &page).is_ok();
    }
    true
}

/// Drop one pin from the page at `va`.
pub fn vm_unpin_page(spt: &Arc<SupplementalPageTable>, va: usize) -> bool {
    let page = match spt.find(va) {
        Some(page) => page,
        None => return false,
    };
    spt.lock.acquire();
    page.unpin();
    spt.lock.release();
    true
}
