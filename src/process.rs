//! Minimal process handle: the fields the storage/VM core's contract
//! needs from "a process", standing in for the external syscall/scheduler
//! layer.
//!
//! Grounded on rv6's `proc.rs` `Proc` (per-process resource ownership —
//! open files, page table, pid), reduced to a simulated page directory plus
//! the supplemental page table and mmap table spec.md §3 assigns to a
//! process. rv6 walks real RISC-V page tables through `PageTable`/`Sv39`;
//! there is no hardware here, so `PageDirectory` is a `HashMap` standing in
//! for `pagedir_get_page`/`pagedir_set_page`/`pagedir_is_accessed`/
//! `pagedir_is_dirty` from the original source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::inode::Inode;
use crate::vm::spte::SupPageTable;

/// A page-aligned user virtual address.
pub type UserPage = u64;
/// A process identifier.
pub type ProcessId = u64;

/// Virtual/physical page size (spec.md GLOSSARY).
pub const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Copy)]
struct PageTableEntry {
    frame: usize,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A simulated page directory: `pagedir_get_page`/`pagedir_set_page` and
/// the accessed/dirty bit queries the original reads off real hardware
/// PTEs, modeled here as explicit state a caller toggles to simulate a CPU
/// access (see `touch`/`mark_dirty`).
pub struct PageDirectory {
    entries: Mutex<HashMap<UserPage, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `pagedir_set_page`: records `page -> frame`. Fails (returns false)
    /// if `page` is already mapped, matching the original's
    /// `pagedir_get_page(...) == NULL` precondition on every call site.
    pub fn set_page(&self, page: UserPage, frame: usize, writable: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&page) {
            return false;
        }
        entries.insert(
            page,
            PageTableEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// `pagedir_get_page`.
    pub fn get_frame(&self, page: UserPage) -> Option<usize> {
        self.entries.lock().unwrap().get(&page).map(|e| e.frame)
    }

    /// `pagedir_clear_page`.
    pub fn clear_page(&self, page: UserPage) {
        self.entries.lock().unwrap().remove(&page);
    }

    /// Simulates a CPU read/execute access to `page`, as the MMU would by
    /// setting the hardware accessed bit.
    pub fn touch(&self, page: UserPage) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&page) {
            e.accessed = true;
        }
    }

    /// Simulates a CPU write to `page`, setting both accessed and dirty.
    pub fn mark_dirty(&self, page: UserPage) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&page) {
            e.accessed = true;
            e.dirty = true;
        }
    }

    /// `pagedir_is_accessed`.
    pub fn is_accessed(&self, page: UserPage) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&page)
            .map(|e| e.accessed)
            .unwrap_or(false)
    }

    /// `pagedir_set_accessed`.
    pub fn set_accessed(&self, page: UserPage, value: bool) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&page) {
            e.accessed = value;
        }
    }

    /// `pagedir_is_dirty`.
    pub fn is_dirty(&self, page: UserPage) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&page)
            .map(|e| e.dirty)
            .unwrap_or(false)
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// A still-open memory mapping: the reopened file handle behind one mapid.
pub struct MmapEntry {
    pub file: Arc<Inode>,
}

/// Per-process table of active mmaps, keyed by `mapid` (spec.md §3 "Mmap
/// record"), mirroring rv6's `FileTable` shape for a different resource.
pub struct MmapTable {
    entries: Mutex<HashMap<u64, MmapEntry>>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, mapid: u64, entry: MmapEntry) {
        self.entries.lock().unwrap().insert(mapid, entry);
    }

    pub fn remove(&self, mapid: u64) -> Option<MmapEntry> {
        self.entries.lock().unwrap().remove(&mapid)
    }

    pub fn contains(&self, mapid: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&mapid)
    }

    /// The reopened file backing `mapid`, for eviction write-back
    /// (`mapid_to_file` in the original source).
    pub fn file(&self, mapid: u64) -> Option<Arc<Inode>> {
        self.entries.lock().unwrap().get(&mapid).map(|e| e.file.clone())
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A process: identity plus the three per-process tables the storage/VM
/// core touches. Everything else about "a process" (its threads, its file
/// descriptor table, its exit status) belongs to the external layer.
pub struct Process {
    pub id: ProcessId,
    pub page_dir: PageDirectory,
    pub sup_page_table: SupPageTable,
    pub mmaps: MmapTable,
    next_mapid: AtomicU64,
}

impl Process {
    pub fn new(id: ProcessId) -> Arc<Self> {
        Arc::new(Self {
            id,
            page_dir: PageDirectory::new(),
            sup_page_table: SupPageTable::new(),
            mmaps: MmapTable::new(),
            next_mapid: AtomicU64::new(1),
        })
    }

    /// Process-local monotonically increasing mapid (spec.md §3).
    pub fn next_mapid(&self) -> u64 {
        self.next_mapid.fetch_add(1, Ordering::SeqCst)
    }
}

/// Registry of live processes, keyed by id. Stands in for the external
/// scheduler's thread list — the frame table's eviction path looks up an
/// FTE's owner through this rather than holding an `Arc<Process>` directly
/// in every entry.
pub struct ProcessTable {
    processes: Mutex<HashMap<ProcessId, Arc<Process>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, process: Arc<Process>) {
        self.processes.lock().unwrap().insert(process.id, process);
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().remove(&id)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
