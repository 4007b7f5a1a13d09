//! Buffered block cache.
//!
//! In-memory set of recently used sectors with dirty tracking and periodic
//! write-back. Grounded on rv6's `bio.rs` (`BufEntry`, pin-before-use
//! discipline) and the original source's `filesys/cache.c` (FIFO eviction
//! scan, `cache_read_at`/`cache_write_at`, `MAX_CACHE_SIZE`).
//!
//! Unlike rv6's `Bcache` (a fixed-capacity `MruArena` of const-generic size
//! reached through `StrongPin`), this cache is an ordinary `Mutex`-guarded
//! `Vec` — there is no hardware memory layout to pin against, and the spec
//! only asks for a single cache-wide mutex (spec.md §4.1 "Concurrency").

use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace, warn};

use crate::device::{BlockDevice, Sector, SECTOR_SIZE};
use crate::error::Result;

/// Maximum number of resident cache entries (spec.md §3).
pub const MAX_CACHE_SIZE: usize = 64;

struct CacheEntry {
    sector: Sector,
    buffer: [u8; SECTOR_SIZE],
    dirty: bool,
    accessed: bool,
    pin_count: u32,
}

impl CacheEntry {
    fn new(sector: Sector, buffer: [u8; SECTOR_SIZE]) -> Self {
        Self {
            sector,
            buffer,
            dirty: false,
            accessed: true,
            pin_count: 0,
        }
    }
}

struct Inner {
    entries: Vec<CacheEntry>,
}

/// The buffered block cache. One instance sits in front of one block
/// device; callers never see a raw sector number resolve to a buffer
/// except through `read_at`/`write_at`.
pub struct Cache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
    /// Signaled whenever a pin is released, so a thread blocked looking for
    /// an evictable entry (spec.md §4.1: "the scan wraps... forward
    /// progress once a pin is released") can retry instead of busy-waiting.
    unpinned: Condvar,
}

impl Cache {
    /// Creates an empty cache in front of `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(MAX_CACHE_SIZE),
            }),
            unpinned: Condvar::new(),
        }
    }

    fn find_evictable(&self, inner: &Inner) -> Option<usize> {
        inner.entries.iter().position(|e| e.pin_count == 0)
    }

    fn evict_at(&self, inner: &mut Inner, idx: usize) -> Result<()> {
        let entry = &inner.entries[idx];
        if entry.dirty {
            debug!("cache: writing back dirty sector {} on eviction", entry.sector);
            self.device.write_sector(entry.sector, &entry.buffer)?;
        }
        inner.entries.remove(idx);
        Ok(())
    }

    /// Reads `size` bytes at `offset` within `sector` into `dst`. Ensures
    /// `sector` is resident first. Returns the number of bytes copied.
    pub fn read_at(
        &self,
        sector: Sector,
        dst: &mut [u8],
        size: usize,
        offset: usize,
    ) -> Result<usize> {
        let mut inner = self.acquire_and_load(sector)?;
        let idx = inner
            .entries
            .iter()
            .position(|e| e.sector == sector)
            .expect("just loaded");
        let entry = &mut inner.entries[idx];
        let n = size.min(dst.len()).min(SECTOR_SIZE.saturating_sub(offset));
        dst[..n].copy_from_slice(&entry.buffer[offset..offset + n]);
        entry.accessed = true;
        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            self.unpinned.notify_all();
        }
        Ok(n)
    }

    /// Writes `size` bytes from `src` into `sector` at `offset`, marking it
    /// dirty. Ensures `sector` is resident first. Returns the number of
    /// bytes copied.
    pub fn write_at(
        &self,
        sector: Sector,
        src: &[u8],
        size: usize,
        offset: usize,
    ) -> Result<usize> {
        let mut inner = self.acquire_and_load(sector)?;
        let idx = inner
            .entries
            .iter()
            .position(|e| e.sector == sector)
            .expect("just loaded");
        let entry = &mut inner.entries[idx];
        let n = size.min(src.len()).min(SECTOR_SIZE.saturating_sub(offset));
        entry.buffer[offset..offset + n].copy_from_slice(&src[..n]);
        entry.dirty = true;
        entry.accessed = true;
        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            self.unpinned.notify_all();
        }
        Ok(n)
    }

    /// Evicts `sector` immediately without writing it back, for callers
    /// returning the sector to the free-map (spec.md §4.1).
    pub fn free(&self, sector: Sector) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.entries.iter().position(|e| e.sector == sector) {
            inner.entries.remove(idx);
        }
    }

    /// Writes every dirty entry to disk. If `halt`, also empties the cache.
    pub fn flush(&self, halt: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut i = 0;
        while i < inner.entries.len() {
            if inner.entries[i].dirty {
                let (sector, buffer) = (inner.entries[i].sector, inner.entries[i].buffer);
                self.device.write_sector(sector, &buffer)?;
                inner.entries[i].dirty = false;
            }
            if halt {
                inner.entries.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Acquires the lock and ensures `sector` is resident, retrying the
    /// wait-for-an-unpinned-entry loop without holding the lock while
    /// blocked.
    fn acquire_and_load(&self, sector: Sector) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.entries.iter().any(|e| e.sector == sector) {
                let idx = inner.entries.iter().position(|e| e.sector == sector).unwrap();
                inner.entries[idx].pin_count += 1;
                inner.entries[idx].accessed = true;
                return Ok(inner);
            }
            if inner.entries.len() < MAX_CACHE_SIZE {
                let mut buffer = [0u8; SECTOR_SIZE];
                // Drop the lock across the device I/O: a miss must not
                // hold the cache mutex during a device read (spec.md §5).
                drop(inner);
                let read_result = self.device.read_sector(sector, &mut buffer);
                inner = self.inner.lock().unwrap();
                read_result?;
                if inner.entries.iter().any(|e| e.sector == sector) {
                    // Lost the race against a concurrent filler; use theirs.
                    continue;
                }
                inner.entries.push(CacheEntry::new(sector, buffer));
                let idx = inner.entries.len() - 1;
                inner.entries[idx].pin_count = 1;
                trace!("cache: loaded sector {sector} into slot {idx}");
                return Ok(inner);
            }
            if let Some(victim) = self.find_evictable(&inner) {
                self.evict_at(&mut inner, victim)?;
                continue;
            }
            warn!("cache: all {MAX_CACHE_SIZE} entries pinned, waiting for a release");
            inner = self.unpinned.wait(inner).unwrap();
        }
    }
}
