//! Top-level assembly: the well-defined root spec.md §9's "Global mutable
//! state" design note asks for in place of free-floating singletons.
//!
//! Grounded on `kaist-cp-rv6/kernel-rs/src/kernel.rs`'s `KernelBuilder`/
//! `Kernel` split, simplified: there is no `static mut` to initialize in
//! place here, so one constructor builds a ready-to-use `Kernel` directly
//! rather than threading a separate builder type through a boot sequence.
//! Directory traversal and a root-directory format are out of this crate's
//! scope (spec.md §1); `Kernel` only brings up the free-map and the
//! subsystems layered on top of it. Callers create whatever inodes they
//! need — including a root directory, self-referencing its own sector as
//! `parent_sector` — through `inodes.create`.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::device::{BlockDevice, Sector};
use crate::error::Result;
use crate::freemap::FreeMap;
use crate::inode::InodeTable;
use crate::process::{Process, ProcessTable};
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapArea;
use crate::writeback::WriteBehind;

/// Sector the free-map bitmap is persisted to.
pub const FREE_MAP_SECTOR: Sector = 0;
/// First sector the free-map is allowed to hand out.
pub const FIRST_DATA_SECTOR: Sector = 1;

/// Per-instance knobs a test wants to vary; sizes fixed by the on-disk
/// format (`SECTOR_SIZE`, `MAX_CACHE_SIZE`, `PAGE_SIZE`, indirect pointer
/// counts) stay `pub const`s next to the code that owns them instead of
/// living here.
#[derive(Clone, Copy)]
pub struct Config {
    /// How often the write-behind task flushes dirty cache entries.
    pub write_behind_interval: Duration,
    /// Maximum number of resident frames the frame table holds.
    pub frame_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_behind_interval: Duration::from_secs(5),
            frame_capacity: 256,
        }
    }
}

/// Bundles every subsystem this crate's contract needs, wired together
/// against a filesystem disk and a swap disk.
pub struct Kernel {
    pub cache: Arc<Cache>,
    pub freemap: FreeMap,
    pub inodes: InodeTable,
    pub frames: FrameTable,
    pub swap: SwapArea,
    pub processes: ProcessTable,
    writeback: WriteBehind,
}

impl Kernel {
    /// Formats a fresh filesystem over `fs_device` (zeroing and persisting
    /// the free-map) and wires it together with `swap_device` and the
    /// subsystems derived from `config`.
    pub fn format(fs_device: Arc<dyn BlockDevice>, swap_device: Box<dyn BlockDevice>, config: Config) -> Result<Self> {
        let cache = Arc::new(Cache::new(fs_device.clone()));
        let data_sectors = fs_device.sector_count().saturating_sub(FIRST_DATA_SECTOR);
        let freemap = FreeMap::new(data_sectors as usize, FIRST_DATA_SECTOR, FREE_MAP_SECTOR);
        freemap.flush(&cache)?;
        Ok(Self::assemble(cache, freemap, swap_device, config))
    }

    /// Reopens a filesystem previously written by [`Kernel::format`],
    /// reloading the free-map from disk instead of starting from scratch.
    pub fn mount(fs_device: Arc<dyn BlockDevice>, swap_device: Box<dyn BlockDevice>, config: Config) -> Result<Self> {
        let cache = Arc::new(Cache::new(fs_device.clone()));
        let data_sectors = fs_device.sector_count().saturating_sub(FIRST_DATA_SECTOR);
        let freemap = FreeMap::load(&cache, data_sectors as usize, FIRST_DATA_SECTOR, FREE_MAP_SECTOR)?;
        Ok(Self::assemble(cache, freemap, swap_device, config))
    }

    fn assemble(cache: Arc<Cache>, freemap: FreeMap, swap_device: Box<dyn BlockDevice>, config: Config) -> Self {
        let writeback = WriteBehind::spawn(cache.clone(), config.write_behind_interval);
        Self {
            cache,
            freemap,
            inodes: InodeTable::new(),
            frames: FrameTable::new(config.frame_capacity),
            swap: SwapArea::new(swap_device),
            processes: ProcessTable::new(),
            writeback,
        }
    }

    /// Flushes every dirty cache entry and stops the write-behind task.
    /// Leaves the `Kernel` unusable for further I/O — mirrors the
    /// original's shutdown-time `cache_flush(true)`.
    pub fn shutdown(self) -> Result<()> {
        self.cache.flush(true)
    }

    /// Tears down an exiting process's storage/VM state: frees every frame
    /// it holds, drops its supplemental page table (releasing the swap
    /// slots still referenced by `Swapped` entries), and removes it from
    /// the process table. Mirrors the original's exit-time composition of
    /// `frame_free`, `destroy_sup_page_table`, and the swap release loop
    /// those freed slots feed into.
    pub fn exit_process(&self, owner: &Process) {
        self.frames.free_all(&self.processes, owner.id);
        for slot in owner.sup_page_table.destroy() {
            self.swap.release(slot);
        }
        self.processes.remove(owner.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn devices() -> (Arc<dyn BlockDevice>, Box<dyn BlockDevice>) {
        (Arc::new(MemBlockDevice::new(4096)), Box::new(MemBlockDevice::new(64)))
    }

    #[test]
    fn format_starts_with_an_empty_free_map() {
        let (fs, swap) = devices();
        let kernel = Kernel::format(fs, swap, Config::default()).unwrap();
        assert_eq!(kernel.freemap.free_count(), kernel.freemap.len());
    }

    #[test]
    fn mount_reloads_free_map_state() {
        let (fs, swap) = devices();
        let kernel = Kernel::format(fs.clone(), swap, Config::default()).unwrap();
        let used_before = kernel.freemap.free_count();
        let sector = kernel
            .inodes
            .create(&kernel.cache, &kernel.freemap, 4096, true, FIRST_DATA_SECTOR)
            .unwrap();
        kernel.shutdown().unwrap();

        let swap2 = Box::new(MemBlockDevice::new(64));
        let remounted = Kernel::mount(fs, swap2, Config::default()).unwrap();
        assert!(remounted.freemap.free_count() < used_before);
        let reopened = remounted.inodes.open(&remounted.cache, sector).unwrap();
        assert_eq!(reopened.length(), 4096);
        assert!(reopened.is_dir());
    }

    #[test]
    fn exit_process_frees_frames_and_swap_slots() {
        let (fs, swap) = devices();
        let mut config = Config::default();
        config.frame_capacity = 1;
        let kernel = Kernel::format(fs, swap, config).unwrap();

        let process = Process::new(1);
        kernel.processes.insert(process.clone());

        kernel
            .frames
            .alloc(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, 0x1000, true)
            .unwrap();
        process.page_dir.set_accessed(0x1000, false);
        // Forces eviction of 0x1000 into swap (capacity 1), leaving a
        // `Swapped` SPTE behind for `exit_process` to reclaim.
        kernel
            .frames
            .alloc(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, 0x2000, true)
            .unwrap();
        assert_eq!(kernel.swap.free_slots(), kernel.swap.total_slots() - 1);

        kernel.exit_process(&process);

        assert_eq!(kernel.frames.resident_count(), 0);
        assert_eq!(kernel.swap.free_slots(), kernel.swap.total_slots());
        assert!(kernel.processes.get(process.id).is_none());
    }
}
