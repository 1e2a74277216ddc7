//! Software page directory: the simulated MMU.
//!
//! One per address space, mapping page-aligned user virtual addresses
//! to pool frames with the usual permission and status bits. User
//! memory accessors translate through it and set the accessed/dirty
//! bits the way the hardware walker would; the VM layer reads and
//! clears those bits to drive writeback and eviction decisions.

use std::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use super::palloc::Kva;
use super::pg_ofs;

bitflags! {
    /// Page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

struct Pte {
    kva: Kva,
    flags: PteFlags,
}

/// A per-address-space page directory. Present entries are exactly the
/// map's keys.
pub struct PageDir {
    entries: SpinMutex<BTreeMap<usize, Pte>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            entries: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// Install a mapping from page `va` to `kva`. Fails (returns
    /// false) if `va` is already mapped.
    pub fn set_page(&self, va: usize, kva: Kva, writable: bool) -> bool {
        assert_eq!(pg_ofs(va), 0);
        let mut entries = self.entries.lock();
        if entries.contains_key(&va) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        entries.insert(va, Pte { kva, flags });
        true
    }

    /// The frame mapped at page `va`, if present.
    pub fn get_page(&self, va: usize) -> Option<Kva> {
        assert_eq!(pg_ofs(va), 0);
        self.entries.lock().get(&va).map(|pte| pte.kva)
    }

    /// Mark page `va` not present. Subsequent access faults.
    pub fn clear_page(&self, va: usize) {
        assert_eq!(pg_ofs(va), 0);
        self.entries.lock().remove(&va);
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.with_flags(va, |f| f.contains(PteFlags::WRITABLE))
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.with_flags(va, |f| f.contains(PteFlags::DIRTY))
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.with_flags(va, |f| f.contains(PteFlags::ACCESSED))
    }

    pub fn set_dirty(&self, va: usize, dirty: bool) {
        self.update_flags(va, PteFlags::DIRTY, dirty);
    }

    pub fn set_accessed(&self, va: usize, accessed: bool) {
        self.update_flags(va, PteFlags::ACCESSED, accessed);
    }

    /// What the hardware walker does on a successful access: set
    /// ACCESSED, and DIRTY too for a write.
    pub fn mark_access(&self, va: usize, write: bool) {
        assert_eq!(pg_ofs(va), 0);
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&va) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }

    /// Address-space switch point. The software directory needs no CR3
    /// load; dispatch simply consults the incoming thread's directory.
    pub fn activate(&self) {}

    /// Drop every mapping. Frames are returned to the pool by their
    /// owning page descriptors, not here.
    pub fn destroy(&self) {
        self.entries.lock().clear();
    }

    /// Number of present entries.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    fn with_flags(&self, va: usize, f: impl FnOnce(PteFlags) -> bool) -> bool {
        assert_eq!(pg_ofs(va), 0);
        self.entries
            .lock()
            .get(&va)
            .map(|pte| f(pte.flags))
            .unwrap_or(false)
    }

    fn update_flags(&self, va: usize, flag: PteFlags, value: bool) {
        assert_eq!(pg_ofs(va), 0);
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&va) {
            if value {
                pte.flags |= flag;
            } else {
                pte.flags &= !flag;
            }
        }
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::palloc::UserPool;

    #[test]
    fn test_set_get_clear() {
        let pool = UserPool::new(1);
        let kva = pool.get_page().unwrap();
        let pd = PageDir::new();

        assert!(pd.set_page(0x1000, kva, true));
        assert!(!pd.set_page(0x1000, kva, true));
        assert_eq!(pd.get_page(0x1000), Some(kva));
        assert!(pd.is_writable(0x1000));

        pd.clear_page(0x1000);
        assert_eq!(pd.get_page(0x1000), None);
    }

    #[test]
    fn test_access_bits() {
        let pool = UserPool::new(1);
        let kva = pool.get_page().unwrap();
        let pd = PageDir::new();
        pd.set_page(0x2000, kva, true);

        assert!(!pd.is_accessed(0x2000));
        pd.mark_access(0x2000, false);
        assert!(pd.is_accessed(0x2000));
        assert!(!pd.is_dirty(0x2000));

        pd.mark_access(0x2000, true);
        assert!(pd.is_dirty(0x2000));

        pd.set_dirty(0x2000, false);
        pd.set_accessed(0x2000, false);
        assert!(!pd.is_dirty(0x2000));
        assert!(!pd.is_accessed(0x2000));
    }
}
