//! Anonymous pages: zero-filled, lazily loaded segments, and
//! swap-backed contents.
//!
//! A clean lazy-segment page is the cheap case throughout: eviction
//! writes nothing and faulting it back re-runs the loader. The first
//! swap-out that observes the page dirty sets a sticky bit, after
//! which the page lives on swap like any other anonymous page.

use std::sync::Arc;

use super::page::{AnonInit, Page, PageKind, SegmentSource};
use super::palloc::Kva;
use super::PGSIZE;
use crate::kernel::Kernel;

enum InPlan {
    Lazy(SegmentSource),
    FromSlot(usize),
    Zero,
}

enum OutPlan {
    /// Clean segment page: eviction is free.
    Nothing,
    /// Write the frame contents to a fresh swap slot.
    ToSwap,
}

/// Fill `kva` with the page's contents.
pub(crate) fn swap_in(kernel: &Arc<Kernel>, page: &Page, kva: Kva) -> bool {
    let plan = {
        let mut kind = page.kind.lock();
        let state = match &mut *kind {
            PageKind::Anon(state) => state,
            _ => unreachable!(),
        };
        if state.is_lazy_clean() {
            match &state.init {
                AnonInit::Segment(source) => InPlan::Lazy(source.clone()),
                AnonInit::Zero => unreachable!(),
            }
        } else if let Some(slot) = state.slot.take() {
            InPlan::FromSlot(slot)
        } else {
            InPlan::Zero
        }
    };

    match plan {
        InPlan::Lazy(source) => load_segment(kernel, &source, kva),
        InPlan::FromSlot(slot) => {
            let mut bytes = vec![0u8; PGSIZE];
            kernel.swap.swap_in(&kernel.fs, slot, &mut bytes);
            kernel.palloc.with_frame(kva, |buf| buf.copy_from_slice(&bytes));
            true
        }
        InPlan::Zero => {
            kernel.palloc.with_frame(kva, |buf| buf.fill(0));
            true
        }
    }
}

/// Save the page's contents before eviction. Records dirtiness
/// stickily so a once-written segment page never silently reverts to
/// its file image.
pub(crate) fn swap_out(kernel: &Arc<Kernel>, page: &Page) -> bool {
    let kva = page.frame().expect("swap_out of a non-resident page").kva;

    let plan = {
        let mut kind = page.kind.lock();
        let state = match &mut *kind {
            PageKind::Anon(state) => state,
            _ => unreachable!(),
        };
        if !state.dirty_sticky && page.writable() {
            state.dirty_sticky = page.spt().pagedir.is_dirty(page.va());
        }
        if state.is_lazy_clean() {
            OutPlan::Nothing
        } else {
            OutPlan::ToSwap
        }
    };

    match plan {
        OutPlan::Nothing => true,
        OutPlan::ToSwap => {
            let bytes = kernel.palloc.with_frame(kva, |buf| buf.to_vec());
            match kernel.swap.swap_out(&kernel.fs, &bytes) {
                Ok(slot) => {
                    let mut kind = page.kind.lock();
                    if let PageKind::Anon(state) = &mut *kind {
                        state.slot = Some(slot);
                    }
                    true
                }
                Err(_) => false,
            }
        }
    }
}

/// Release the page's resources: its swap slot, and its frame if it
/// is still resident.
pub(crate) fn destroy(kernel: &Arc<Kernel>, page: &Page) {
    let slot = {
        let mut kind = page.kind.lock();
        match &mut *kind {
            PageKind::Anon(state) => state.slot.take(),
            // Never claimed: nothing was ever allocated.
            PageKind::UninitAnon { .. } => None,
            _ => unreachable!(),
        }
    };
    if let Some(slot) = slot {
        kernel.swap.free(slot);
    }

    if let Some(frame) = page.frame.lock().take() {
        page.spt().pagedir.clear_page(page.va());
        kernel.palloc.free_page(frame.kva);
    }
}

/// Run the segment loader: read the file range, zero the tail.
fn load_segment(kernel: &Arc<Kernel>, source: &SegmentSource, kva: Kva) -> bool {
    assert!(source.read_bytes <= PGSIZE);

    let held = kernel.fs.is_held();
    if !held {
        kernel.fs.lock().acquire();
    }
    source.file.seek(source.offset);
    let read = kernel.palloc.with_frame(kva, |buf| {
        let n = source.file.read(&mut buf[..source.read_bytes]);
        buf[source.read_bytes..].fill(0);
        n
    });
    if !held {
        kernel.fs.lock().release();
    }

    read == source.read_bytes
}
