//! Swap area: a dedicated block device addressed in page-sized slots.
//!
//! Grounded on the original source's `vm/swap.c` — a bitmap over
//! `DISK_UNIT_SIZE`-sector slots where a `true` bit means *free* (note the
//! polarity: `bitmap_set_all(swap_table, true)` at init, `bitmap_scan_and_flip`
//! for `true`), I/O done sector-by-sector across the slot.

use std::sync::Mutex;

use log::{trace, warn};

use crate::device::{BlockDevice, Sector, SECTOR_SIZE};
use crate::error::{Error, Result};

/// Page size in bytes (spec.md GLOSSARY: "typically 4 KiB").
pub const PAGE_SIZE: usize = 4096;
/// Sectors per page-sized swap slot.
pub const DISK_UNIT_SIZE: usize = PAGE_SIZE / SECTOR_SIZE;

/// A swap slot index.
pub type SwapSlot = u64;

struct Inner {
    /// `true` = free, `false` = in use — matches the original's polarity.
    free: Vec<bool>,
}

/// Page-granularity scratch space backed by its own block device.
pub struct SwapArea {
    device: Box<dyn BlockDevice>,
    inner: Mutex<Inner>,
}

impl SwapArea {
    /// Sizes the swap area from `device`'s sector count.
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() as usize / DISK_UNIT_SIZE;
        Self {
            device,
            inner: Mutex::new(Inner {
                free: vec![true; slots],
            }),
        }
    }

    /// Writes `page` (exactly `PAGE_SIZE` bytes) into a freshly allocated
    /// slot and returns it. Exhaustion is `SwapExhausted`; spec.md §4.6
    /// calls this fatal, so the one caller on the eviction path panics on
    /// it — this function itself stays total, so it remains unit-testable.
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot> {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .free
                .iter()
                .position(|&f| f)
                .ok_or(Error::SwapExhausted)?;
            inner.free[idx] = false;
            idx
        };
        for i in 0..DISK_UNIT_SIZE {
            let sector = slot * DISK_UNIT_SIZE + i;
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write_sector(sector as Sector, &buf)?;
        }
        trace!("swap: wrote page to slot {slot}");
        Ok(slot as SwapSlot)
    }

    /// Reads slot `slot` back into `dst` and frees the slot.
    pub fn swap_in(&self, slot: SwapSlot, dst: &mut [u8; PAGE_SIZE]) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.free[slot as usize] = true;
        }
        for i in 0..DISK_UNIT_SIZE {
            let sector = slot as usize * DISK_UNIT_SIZE + i;
            let mut buf = [0u8; SECTOR_SIZE];
            self.device.read_sector(sector as Sector, &mut buf)?;
            dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        trace!("swap: read page from slot {slot}");
        Ok(())
    }

    /// Marks `slot` free without any I/O — used on process teardown to
    /// drop swap copies that will never be read back.
    pub fn release(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock().unwrap();
        if inner.free[slot as usize] {
            warn!("swap: releasing already-free slot {slot}");
        }
        inner.free[slot as usize] = true;
    }

    pub fn total_slots(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().unwrap().free.iter().filter(|&&f| f).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn area(slots: u32) -> SwapArea {
        SwapArea::new(Box::new(MemBlockDevice::new(slots * DISK_UNIT_SIZE as u32)))
    }

    #[test]
    fn out_then_in_round_trips() {
        let area = area(4);
        let page = [0x5Au8; PAGE_SIZE];
        let slot = area.swap_out(&page).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        area.swap_in(slot, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn exhaustion_is_reported() {
        let area = area(1);
        let page = [0u8; PAGE_SIZE];
        area.swap_out(&page).unwrap();
        assert!(matches!(area.swap_out(&page), Err(Error::SwapExhausted)));
    }

    #[test]
    fn release_frees_without_io() {
        let area = area(1);
        let page = [1u8; PAGE_SIZE];
        let slot = area.swap_out(&page).unwrap();
        assert_eq!(area.free_slots(), 0);
        area.release(slot);
        assert_eq!(area.free_slots(), 1);
    }
}
