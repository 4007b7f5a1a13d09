//! Block device primitive.
//!
//! Fixed 512-byte sectors, synchronous `read`/`write`. rv6's `virtio_disk.rs`
//! drives an actual virtio queue behind the same kind of narrow interface;
//! here the trait is the whole contract, and the two implementations below
//! stand in for "a disk" in tests the way a host build of an OS course
//! project usually swaps in a file-backed disk image.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Size of a sector in bytes. Fixed by the on-disk format; see spec.md §3.
pub const SECTOR_SIZE: usize = 512;

/// A sector number. `INVALID_SECTOR` is a distinguished out-of-band value.
pub type Sector = u32;

/// Distinguished "no such sector" marker, per spec.md §3.
pub const INVALID_SECTOR: Sector = Sector::MAX;

/// A raw block device: fixed-size sector read/write, nothing more.
///
/// Implementors serialize their own I/O internally (spec.md §5: "Block
/// device: serialized by its own internal lock").
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable sectors.
    fn sector_count(&self) -> u32;

    /// Reads one sector into `dst`.
    fn read_sector(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    /// Writes one sector from `src`.
    fn write_sector(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) -> Result<()>;
}

/// An in-memory block device. Useful for unit tests that don't care about
/// persistence across process restarts.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemBlockDevice {
    /// Creates a zero-filled device with `count` sectors.
    pub fn new(count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read_sector(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors
            .get(sector as usize)
            .ok_or_else(|| Error::Io(format!("sector {sector} out of range")))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors
            .get_mut(sector as usize)
            .ok_or_else(|| Error::Io(format!("sector {sector} out of range")))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// A block device backed by a host file, used in tests that need the
/// contents to survive a close/reopen of the file-system core (spec.md §8
/// scenarios 1, 4, 6).
pub struct FileBlockDevice {
    file: Mutex<File>,
    sector_count: u32,
}

impl FileBlockDevice {
    /// Opens (creating if necessary) a disk image of `count` sectors at
    /// `path`. If the file already exists and is shorter, it is extended
    /// with zero sectors; existing contents beyond that are left as-is.
    pub fn open(path: impl AsRef<Path>, count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;
        file.set_len((count as u64) * (SECTOR_SIZE as u64))
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self {
            file: Mutex::new(file),
            sector_count: count,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sector(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((sector as u64) * (SECTOR_SIZE as u64)))
            .map_err(|e| Error::Io(e.to_string()))?;
        file.read_exact(dst).map_err(|e| Error::Io(e.to_string()))
    }

    fn write_sector(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((sector as u64) * (SECTOR_SIZE as u64)))
            .map_err(|e| Error::Io(e.to_string()))?;
        file.write_all(src).map_err(|e| Error::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xAB;
        dev.write_sector(2, &buf).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        dev.read_sector(2, &mut out).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(1);
        let buf = [0u8; SECTOR_SIZE];
        assert!(dev.write_sector(5, &buf).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev = FileBlockDevice::open(&path, 4).unwrap();
        let mut buf = [1u8; SECTOR_SIZE];
        buf[10] = 42;
        dev.write_sector(1, &buf).unwrap();
        drop(dev);

        let dev2 = FileBlockDevice::open(&path, 4).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        dev2.read_sector(1, &mut out).unwrap();
        assert_eq!(out, buf);
    }
}
