//! Error types for the Pyrite kernel core.
//!
//! Contract violations (re-entering an owned lock, scheduling with
//! interrupts enabled, releasing a lock that is not held) are bugs and
//! panic via assertions. `KernelError` covers the recoverable surface:
//! resource exhaustion, rejected mappings, and bad user-supplied values.

use core::fmt;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Recoverable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The physical page pool (or a kernel allocation) is exhausted.
    OutOfMemory {
        requested: usize,
    },
    /// Every resident frame is pinned; eviction found no victim.
    NoEvictableFrame,
    /// The swap device has no free slot.
    SwapFull,
    /// A virtual address is outside the user range or misaligned.
    InvalidAddress {
        addr: usize,
    },
    /// The supplemental page table already maps this address.
    AlreadyMapped {
        addr: usize,
    },
    /// No page descriptor covers this address.
    NotMapped {
        addr: usize,
    },
    /// A write was attempted through a read-only mapping.
    ReadOnly {
        addr: usize,
    },
    /// No thread with this identifier exists (or it is not a child).
    ThreadNotFound {
        tid: i32,
    },
    /// A file system object was not found.
    FileNotFound,
    /// A file descriptor does not name an open file.
    BadFileDescriptor {
        fd: i32,
    },
    /// An mmap identifier does not name a live region.
    BadMapId {
        mapid: i32,
    },
    /// A generic invalid argument, named for diagnostics.
    InvalidArgument {
        name: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::NoEvictableFrame => write!(f, "all resident frames are pinned"),
            KernelError::SwapFull => write!(f, "no free swap slot"),
            KernelError::InvalidAddress { addr } => write!(f, "invalid address {:#x}", addr),
            KernelError::AlreadyMapped { addr } => write!(f, "address {:#x} already mapped", addr),
            KernelError::NotMapped { addr } => write!(f, "address {:#x} not mapped", addr),
            KernelError::ReadOnly { addr } => write!(f, "write to read-only page {:#x}", addr),
            KernelError::ThreadNotFound { tid } => write!(f, "no such thread {}", tid),
            KernelError::FileNotFound => write!(f, "file not found"),
            KernelError::BadFileDescriptor { fd } => write!(f, "bad file descriptor {}", fd),
            KernelError::BadMapId { mapid } => write!(f, "bad mmap id {}", mapid),
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = KernelError::InvalidAddress { addr: 0xdead_b000 };
        assert!(format!("{}", err).contains("0xdeadb000"));

        let err = KernelError::BadFileDescriptor { fd: 7 };
        assert!(format!("{}", err).contains('7'));
    }
}
