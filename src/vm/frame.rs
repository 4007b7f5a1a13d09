//! Frame table: physical-frame bookkeeping with clock-style eviction.
//!
//! Grounded on the original source's `vm/frame.c`
//! (`add_frame_table`/`frame_free`/`single_frame_free`/`evict_frame`) for
//! the table shape and the accessed-bit clock scan, and rv6's `kalloc.rs`
//! for the allocator-object idiom (a struct with `alloc`/`free`, not a
//! free-floating global). Unlike the original, eviction here branches on
//! whether a frame is mmap-backed (spec.md §4.4 corrects the source, which
//! swaps out unconditionally — see SPEC_FULL.md §4).

use std::sync::Mutex;

use log::{debug, trace};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::process::{Process, ProcessId, ProcessTable, UserPage};
use crate::vm::swap::{SwapArea, PAGE_SIZE};

/// A frame identifier. Frames are simulated as owned `PAGE_SIZE` buffers
/// rather than real physical memory.
pub type FrameId = usize;

/// Distinguishes an mmap-backed frame from an anonymous one, carrying just
/// enough to write it back to its file on eviction (spec.md §3).
#[derive(Clone)]
pub struct MmapInfo {
    pub mapid: u64,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

struct Fte {
    frame_id: FrameId,
    page: UserPage,
    writable: bool,
    owner: ProcessId,
    content: Box<[u8; PAGE_SIZE]>,
    mmap: Option<MmapInfo>,
}

struct Inner {
    entries: Vec<Fte>,
    cursor: usize,
    next_frame_id: FrameId,
    capacity: usize,
}

/// A snapshot of one frame-table entry, returned to callers (e.g. `munmap`)
/// that need to inspect an entry without holding the table's lock.
pub struct FrameSnapshot {
    pub frame_id: FrameId,
    pub page: UserPage,
    pub owner: ProcessId,
    pub mmap: Option<MmapInfo>,
}

/// The frame table. One `frame_lock`-equivalent mutex protects the entry
/// list and the clock cursor (spec.md §4.4 "Concurrency").
pub struct FrameTable {
    inner: Mutex<Inner>,
}

impl FrameTable {
    /// Creates a table that holds at most `capacity` resident frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(capacity),
                cursor: 0,
                next_frame_id: 0,
                capacity,
            }),
        }
    }

    /// Obtains a frame for `page` in `owner`, evicting if the table is
    /// full. Fails with `OutOfMemory` if `page` is already mapped in
    /// `owner`'s page directory.
    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        processes: &ProcessTable,
        cache: &Cache,
        freemap: &FreeMap,
        swap: &SwapArea,
        owner: &Process,
        page: UserPage,
        writable: bool,
    ) -> Result<FrameId> {
        self.alloc_with(processes, cache, freemap, swap, None, owner, page, writable)
    }

    /// As `alloc`, tagging the new frame as backed by an mmap.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_mmap(
        &self,
        processes: &ProcessTable,
        cache: &Cache,
        freemap: &FreeMap,
        swap: &SwapArea,
        owner: &Process,
        page: UserPage,
        writable: bool,
        mapid: u64,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<FrameId> {
        let info = MmapInfo {
            mapid,
            offset,
            read_bytes,
            zero_bytes,
        };
        self.alloc_with(processes, cache, freemap, swap, Some(info), owner, page, writable)
    }

    #[allow(clippy::too_many_arguments)]
    fn alloc_with(
        &self,
        processes: &ProcessTable,
        cache: &Cache,
        freemap: &FreeMap,
        swap: &SwapArea,
        mmap: Option<MmapInfo>,
        owner: &Process,
        page: UserPage,
        writable: bool,
    ) -> Result<FrameId> {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.len() < inner.capacity {
                let frame_id = inner.next_frame_id;
                inner.next_frame_id += 1;
                inner.entries.push(Fte {
                    frame_id,
                    page,
                    writable,
                    owner: owner.id,
                    content: Box::new([0u8; PAGE_SIZE]),
                    mmap,
                });
                drop(inner);
                if !owner.page_dir.set_page(page, frame_id, writable) {
                    self.free_one(frame_id);
                    return Err(Error::OutOfMemory);
                }
                trace!("frame: allocated frame {frame_id} for page {page:#x}");
                return Ok(frame_id);
            }
            drop(inner);
            // No free slot; evict one and retry. This cannot loop forever
            // as long as some entry's page is eventually unaccessed, which
            // the clock scan's accessed-bit clearing guarantees.
            self.evict_locked(processes, cache, freemap, swap)?;
        }
    }

    /// Clock-style eviction: advance past every entry whose page is
    /// currently accessed (clearing the bit as we go), evict the first one
    /// that isn't.
    fn evict_locked(&self, processes: &ProcessTable, cache: &Cache, freemap: &FreeMap, swap: &SwapArea) -> Result<()> {
        let (victim, owner_id) = loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.is_empty() {
                return Err(Error::OutOfMemory);
            }
            let len = inner.entries.len();
            let idx = inner.cursor % len;
            let owner_id = inner.entries[idx].owner;
            let page = inner.entries[idx].page;
            let Some(owner) = processes.get(owner_id) else {
                // Owner gone (torn down without freeing its frames): evict
                // it unconditionally.
                inner.cursor = (idx + 1) % len.max(1);
                let fte = inner.entries.remove(idx);
                break (fte, owner_id);
            };
            if owner.page_dir.is_accessed(page) {
                owner.page_dir.set_accessed(page, false);
                inner.cursor = (idx + 1) % len;
                continue;
            }
            inner.cursor = idx % len.max(1);
            let fte = inner.entries.remove(idx);
            break (fte, owner_id);
        };

        let owner = processes.get(owner_id);
        if let Some(owner) = &owner {
            let dirty = owner.page_dir.is_dirty(victim.page);
            owner.page_dir.clear_page(victim.page);

            match &victim.mmap {
                None => {
                    let slot = swap.swap_out(&victim.content).expect("swap exhaustion is fatal");
                    owner.sup_page_table.add_swap(victim.page, slot, victim.writable);
                }
                Some(info) => {
                    if dirty {
                        if let Some(file) = owner.mmaps.file(info.mapid) {
                            file.write_at(
                                cache,
                                freemap,
                                &victim.content[..info.read_bytes],
                                info.read_bytes,
                                info.offset,
                            )
                            .ok();
                        }
                    }
                }
            }
        }
        debug!("frame: evicted frame {} (page {:#x})", victim.frame_id, victim.page);
        Ok(())
    }

    /// Removes every frame belonging to `owner`, unmapping it from that
    /// process's page directory (`frame_free`).
    pub fn free_all(&self, processes: &ProcessTable, owner: ProcessId) {
        let mut inner = self.inner.lock().unwrap();
        let mut i = 0;
        let mut freed = Vec::new();
        while i < inner.entries.len() {
            if inner.entries[i].owner == owner {
                freed.push(inner.entries.remove(i));
            } else {
                i += 1;
            }
        }
        drop(inner);
        if let Some(process) = processes.get(owner) {
            for fte in freed {
                process.page_dir.clear_page(fte.page);
            }
        }
    }

    /// Removes a single frame by id without touching any page directory
    /// (`single_frame_free`) — used to roll back a frame whose mapping
    /// into the page directory failed.
    pub fn free_one(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.frame_id != frame_id);
    }

    /// Runs `f` with mutable access to frame `frame_id`'s content, for
    /// zero-filling or copying file/swap data in after allocation.
    pub fn with_content_mut<R>(&self, frame_id: FrameId, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter_mut()
            .find(|e| e.frame_id == frame_id)
            .map(|e| f(&mut e.content))
    }

    /// A snapshot of frame `frame_id`'s content, for write-back.
    pub fn content_of(&self, frame_id: FrameId) -> Option<[u8; PAGE_SIZE]> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().find(|e| e.frame_id == frame_id).map(|e| *e.content)
    }

    /// All resident frames currently tagged with `mapid` under `owner`
    /// (used by `munmap` to enumerate frames it must write back and free).
    pub fn snapshot_mapping(&self, owner: ProcessId, mapid: u64) -> Vec<FrameSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.owner == owner && matches!(&e.mmap, Some(m) if m.mapid == mapid))
            .map(|e| FrameSnapshot {
                frame_id: e.frame_id,
                page: e.page,
                owner: e.owner,
                mmap: e.mmap.clone(),
            })
            .collect()
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Services a page fault for `page` in `owner` by consulting its
    /// supplemental page table and reloading the page into a fresh frame.
    /// Returns `false` if `owner` has no SPTE for `page` (not this table's
    /// fault to handle — the external fault handler decides whether that
    /// is a stack growth or a segfault). Mirrors `load_page`, generalized
    /// from its swap-only original to all three SPTE variants.
    pub fn load(
        &self,
        processes: &ProcessTable,
        cache: &Cache,
        freemap: &FreeMap,
        swap: &SwapArea,
        owner: &Process,
        page: UserPage,
    ) -> Result<bool> {
        use crate::vm::spte::Spte;

        let Some(spte) = owner.sup_page_table.find(page) else {
            return Ok(false);
        };

        match spte {
            Spte::Swapped { swap_slot, writable } => {
                let frame_id = self.alloc(processes, cache, freemap, swap, owner, page, writable)?;
                self.with_content_mut(frame_id, |buf| swap.swap_in(swap_slot, buf))
                    .expect("frame just allocated")?;
                owner.sup_page_table.remove(page);
            }
            Spte::FileBacked {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            } => {
                let frame_id = self.alloc(processes, cache, freemap, swap, owner, page, writable)?;
                self.with_content_mut(frame_id, |buf| -> Result<()> {
                    file.read_at(cache, &mut buf[..read_bytes], read_bytes, offset)?;
                    buf[read_bytes..read_bytes + zero_bytes].fill(0);
                    Ok(())
                })
                .expect("frame just allocated")?;
                owner.sup_page_table.remove(page);
            }
            Spte::MmapBacked {
                mapid,
                file,
                offset,
                read_bytes,
                zero_bytes,
            } => {
                let frame_id = self.alloc_mmap(
                    processes, cache, freemap, swap, owner, page, true, mapid, offset, read_bytes, zero_bytes,
                )?;
                self.with_content_mut(frame_id, |buf| -> Result<()> {
                    file.read_at(cache, &mut buf[..read_bytes], read_bytes, offset)?;
                    buf[read_bytes..read_bytes + zero_bytes].fill(0);
                    Ok(())
                })
                .expect("frame just allocated")?;
                owner.sup_page_table.remove(page);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn harness(capacity: usize) -> (FrameTable, ProcessTable, Cache, FreeMap, SwapArea, Arc<Process>) {
        let table = FrameTable::new(capacity);
        let processes = ProcessTable::new();
        let cache = Cache::new(Arc::new(crate::device::MemBlockDevice::new(64)));
        let freemap = FreeMap::new(32, 32, 0);
        let swap = SwapArea::new(Box::new(crate::device::MemBlockDevice::new(64)));
        let process = Process::new(1);
        processes.insert(process.clone());
        (table, processes, cache, freemap, swap, process)
    }

    #[test]
    fn alloc_rejects_double_mapping_and_rolls_back() {
        let (table, processes, cache, freemap, swap, process) = harness(4);
        table.alloc(&processes, &cache, &freemap, &swap, &process, 0x1000, true).unwrap();
        assert!(table
            .alloc(&processes, &cache, &freemap, &swap, &process, 0x1000, true)
            .is_err());
        assert_eq!(table.resident_count(), 1);
    }

    #[test]
    fn eviction_skips_accessed_pages() {
        let (table, processes, cache, freemap, swap, process) = harness(1);
        table.alloc(&processes, &cache, &freemap, &swap, &process, 0x1000, true).unwrap();
        process.page_dir.touch(0x1000);
        // Only one slot; allocating a second page must evict the first,
        // clearing its accessed bit on the first clock pass and then
        // evicting it on the second (there is nothing else to skip to).
        table.alloc(&processes, &cache, &freemap, &swap, &process, 0x2000, true).unwrap();
        assert_eq!(table.resident_count(), 1);
        assert!(process.page_dir.get_frame(0x1000).is_none());
        assert!(process.sup_page_table.find(0x1000).is_some());
    }

    #[test]
    fn free_all_clears_every_owned_page() {
        let (table, processes, cache, freemap, swap, process) = harness(4);
        table.alloc(&processes, &cache, &freemap, &swap, &process, 0x1000, true).unwrap();
        table.alloc(&processes, &cache, &freemap, &swap, &process, 0x2000, true).unwrap();
        table.free_all(&processes, process.id);
        assert_eq!(table.resident_count(), 0);
        assert!(process.page_dir.get_frame(0x1000).is_none());
        assert!(process.page_dir.get_frame(0x2000).is_none());
    }

    #[test]
    fn eviction_then_load_round_trips_through_swap() {
        let (table, processes, cache, freemap, swap, process) = harness(1);
        let frame_id = table
            .alloc(&processes, &cache, &freemap, &swap, &process, 0x1000, true)
            .unwrap();
        table
            .with_content_mut(frame_id, |buf| buf.fill(0x42))
            .unwrap();
        process.page_dir.touch(0x1000);
        process.page_dir.set_accessed(0x1000, false);

        // Forces eviction of 0x1000 (the only resident frame).
        table
            .alloc(&processes, &cache, &freemap, &swap, &process, 0x2000, true)
            .unwrap();
        assert!(process.sup_page_table.find(0x1000).is_some());

        table.free_all(&processes, process.id);
        let loaded = table
            .load(&processes, &cache, &freemap, &swap, &process, 0x1000)
            .unwrap();
        assert!(loaded);
        let frame_id = process.page_dir.get_frame(0x1000).unwrap();
        let content = table.content_of(frame_id).unwrap();
        assert!(content.iter().all(|&b| b == 0x42));
    }
}
