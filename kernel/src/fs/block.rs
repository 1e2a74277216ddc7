//! In-memory block device.
//!
//! A flat array of 512-byte sectors; the swap store lays page-sized
//! slots over it. No header, no persistence, no crash recovery.

use spin::Mutex as SpinMutex;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// A fixed-size sector-addressed device.
pub struct BlockDevice {
    sectors: SpinMutex<Vec<u8>>,
    sector_count: usize,
}

impl BlockDevice {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: SpinMutex::new(vec![0; sector_count * SECTOR_SIZE]),
            sector_count,
        }
    }

    /// Device size in sectors.
    pub fn size(&self) -> usize {
        self.sector_count
    }

    /// Read one sector into `buf`, which must be `SECTOR_SIZE` bytes.
    pub fn read(&self, sector: usize, buf: &mut [u8]) {
        assert!(sector < self.sector_count, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.sectors.lock();
        buf.copy_from_slice(&data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
    }

    /// Write one sector from `buf`, which must be `SECTOR_SIZE` bytes.
    pub fn write(&self, sector: usize, buf: &[u8]) {
        assert!(sector < self.sector_count, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.sectors.lock();
        data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].copy_from_slice(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_round_trip() {
        let dev = BlockDevice::new(4);
        let mut out = [0u8; SECTOR_SIZE];
        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        dev.write(2, &pattern);
        dev.read(2, &mut out);
        assert_eq!(out, pattern);

        // Other sectors stay zero.
        dev.read(1, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        let dev = BlockDevice::new(1);
        let buf = [0u8; SECTOR_SIZE];
        dev.write(1, &buf);
    }
}
