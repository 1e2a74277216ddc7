//! Swap slot store.
//!
//! Page-sized slots laid out back to back from sector 0 of the swap
//! device, tracked by a bitmap: one slot per page, allocated on swap
//! out, freed on swap in or page destruction. Swap shares its device
//! with the file system, so all three operations take the file system
//! lock, unless the caller already holds it; the explicit reentrancy
//! probe detects that case.

use spin::Mutex as SpinMutex;

use super::{Bitmap, PGSIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::block::{BlockDevice, SECTOR_SIZE};
use crate::fs::FileSys;

/// Sectors occupied by one slot.
const SECTORS_PER_SLOT: usize = PGSIZE / SECTOR_SIZE;

/// The swap store.
pub struct SwapTable {
    device: BlockDevice,
    map: SpinMutex<Bitmap>,
    slot_count: usize,
}

impl SwapTable {
    pub(crate) fn new(swap_pages: usize) -> Self {
        let device = BlockDevice::new(swap_pages * SECTORS_PER_SLOT);
        let slot_count = device.size() / SECTORS_PER_SLOT;
        log::debug!("[SWAP] {} slots on swap device", slot_count);
        Self {
            device,
            map: SpinMutex::new(Bitmap::new(slot_count)),
            slot_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slots currently allocated.
    pub fn used_slots(&self) -> usize {
        self.map.lock().count_set()
    }

    /// Whether `slot` is allocated.
    pub fn slot_in_use(&self, slot: usize) -> bool {
        self.map.lock().get(slot)
    }

    /// Write one page to a freshly allocated slot and return it.
    pub fn swap_out(&self, fs: &FileSys, page: &[u8]) -> KernelResult<usize> {
        assert_eq!(page.len(), PGSIZE);
        let slot = match self.map.lock().scan_and_flip() {
            Some(slot) => slot,
            None => {
                log::warn!("[SWAP] no free swap slot");
                return Err(KernelError::SwapFull);
            }
        };

        let held = fs.is_held();
        if !held {
            fs.lock().acquire();
        }
        for i in 0..SECTORS_PER_SLOT {
            self.device.write(
                slot * SECTORS_PER_SLOT + i,
                &page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        if !held {
            fs.lock().release();
        }
        Ok(slot)
    }

    /// Read `slot` into one page buffer and free the slot.
    pub fn swap_in(&self, fs: &FileSys, slot: usize, page: &mut [u8]) {
        assert_eq!(page.len(), PGSIZE);
        assert!(self.slot_in_use(slot), "swap-in of a free slot");

        let held = fs.is_held();
        if !held {
            fs.lock().acquire();
        }
        for i in 0..SECTORS_PER_SLOT {
            self.device.read(
                slot * SECTORS_PER_SLOT + i,
                &mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        if !held {
            fs.lock().release();
        }
        self.map.lock().reset(slot);
    }

    /// Free a slot without reading it (page destruction).
    pub fn free(&self, slot: usize) {
        self.map.lock().reset(slot);
    }
}
