//! In-memory file system.
//!
//! The kernel core consumes only a narrow contract from the real file
//! system (create/remove/open plus per-handle read/write/seek/tell)
//! and serializes all of it behind one lock, swap I/O included, since
//! swap shares the underlying device. That contract is implemented
//! here over an in-memory name-to-bytes map. Files have fixed extents:
//! writes past end-of-file are truncated, not extended, which the mmap
//! writeback path relies on.

pub mod block;

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::Lock;

/// An open file handle: shared contents plus a private offset.
pub struct File {
    data: Arc<SpinMutex<Vec<u8>>>,
    pos: SpinMutex<usize>,
}

impl File {
    /// Duplicate this handle with an independent offset at zero.
    pub fn reopen(&self) -> File {
        File {
            data: self.data.clone(),
            pos: SpinMutex::new(0),
        }
    }

    /// File length in bytes.
    pub fn length(&self) -> usize {
        self.data.lock().len()
    }

    /// Read up to `buf.len()` bytes at the current offset, advancing
    /// it. Returns the number of bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let mut pos = self.pos.lock();
        let available = data.len().saturating_sub(*pos);
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        n
    }

    /// Write up to `buf.len()` bytes at the current offset, advancing
    /// it. Writes stop at end-of-file; returns the number of bytes
    /// written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        let mut pos = self.pos.lock();
        let available = data.len().saturating_sub(*pos);
        let n = buf.len().min(available);
        data[*pos..*pos + n].copy_from_slice(&buf[..n]);
        *pos += n;
        n
    }

    /// Move the offset to `pos` (clamping happens at access time).
    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    /// Current offset.
    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }
}

/// The file system: a name-to-contents map and the single lock that
/// serializes file and swap block I/O.
pub struct FileSys {
    lock: Lock,
    files: SpinMutex<BTreeMap<String, Arc<SpinMutex<Vec<u8>>>>>,
}

impl FileSys {
    pub(crate) fn new(format: bool) -> Self {
        if format {
            log::debug!("[FS] formatting file system");
        }
        Self {
            lock: Lock::new(),
            files: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// The file system lock. Callers that may already hold it (the
    /// page-fault path re-entering from a syscall) must consult
    /// [`is_held`](Self::is_held) before acquiring.
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Whether the calling thread already holds the file system lock.
    pub fn is_held(&self) -> bool {
        self.lock.held_by_current_thread()
    }

    /// Create a file of `initial_size` zero bytes. Fails if the name
    /// is taken.
    pub fn create(&self, name: &str, initial_size: usize) -> KernelResult<()> {
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return Err(KernelError::InvalidArgument { name: "file exists" });
        }
        files.insert(name.to_owned(), Arc::new(SpinMutex::new(vec![0; initial_size])));
        Ok(())
    }

    /// Remove a file by name. Handles already open keep working.
    pub fn remove(&self, name: &str) -> KernelResult<()> {
        self.files
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or(KernelError::FileNotFound)
    }

    /// Open a file, yielding a fresh handle at offset zero.
    pub fn open(&self, name: &str) -> KernelResult<File> {
        let files = self.files.lock();
        let data = files.get(name).ok_or(KernelError::FileNotFound)?;
        Ok(File {
            data: data.clone(),
            pos: SpinMutex::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FileSys {
        FileSys::new(true)
    }

    #[test]
    fn test_create_open_read_write() {
        let fs = fs();
        fs.create("data", 8).unwrap();
        assert!(fs.create("data", 8).is_err());

        let f = fs.open("data").unwrap();
        assert_eq!(f.length(), 8);
        assert_eq!(f.write(b"abcdef"), 6);

        let g = fs.open("data").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(g.read(&mut buf), 8);
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(&buf[6..], &[0, 0]);
    }

    #[test]
    fn test_write_does_not_extend() {
        let fs = fs();
        fs.create("fixed", 4).unwrap();
        let f = fs.open("fixed").unwrap();
        f.seek(2);
        assert_eq!(f.write(b"zzzz"), 2);
        assert_eq!(f.length(), 4);
    }

    #[test]
    fn test_reopen_has_independent_offset() {
        let fs = fs();
        fs.create("shared", 4).unwrap();
        let f = fs.open("shared").unwrap();
        f.write(b"wxyz");

        let g = f.reopen();
        assert_eq!(g.tell(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(g.read(&mut buf), 4);
        assert_eq!(&buf, b"wxyz");
    }

    #[test]
    fn test_remove_keeps_open_handles_alive() {
        let fs = fs();
        fs.create("gone", 4).unwrap();
        let f = fs.open("gone").unwrap();
        fs.remove("gone").unwrap();
        assert!(fs.open("gone").is_err());

        f.write(b"ok");
        f.seek(0);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(&buf, b"ok");
    }
}
