//! Supplemental page table: per-process record of pages not currently
//! resident in a frame.
//!
//! Grounded on the original source's `vm/page.c`
//! (`sup_page_table_entry`/`load_page`/`add_sup_page_table_entry`/
//! `destroy_sup_page_table`), generalized from its swap-only variant to the
//! three-variant shape spec.md §3 calls for ("Variant SPTE" in §9) so the
//! file-backed and mmap-backed cases — handled by the richer `mmap`
//! implementation this crate also carries — get the same tagged-enum
//! treatment instead of a bare `disk_num` field.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::inode::Inode;
use crate::process::UserPage;
use crate::vm::swap::SwapSlot;

/// A supplemental page-table entry: what to do when a fault hits `page`.
#[derive(Clone)]
pub enum Spte {
    Swapped {
        swap_slot: SwapSlot,
        writable: bool,
    },
    FileBacked {
        file: Arc<Inode>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    MmapBacked {
        mapid: u64,
        file: Arc<Inode>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

impl Spte {
    pub(crate) fn writable(&self) -> bool {
        match self {
            Spte::Swapped { writable, .. } => *writable,
            Spte::FileBacked { writable, .. } => *writable,
            Spte::MmapBacked { .. } => true,
        }
    }
}

/// Per-process table of absent pages, keyed by user virtual page.
/// Mutation and lookup are serialized by one mutex (`sup_page_table_lock`
/// in spec.md §4.5).
pub struct SupPageTable {
    entries: Mutex<HashMap<UserPage, Spte>>,
}

impl SupPageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_swap(&self, page: UserPage, swap_slot: SwapSlot, writable: bool) {
        self.entries
            .lock()
            .unwrap()
            .insert(page, Spte::Swapped { swap_slot, writable });
    }

    pub fn add_file(
        &self,
        page: UserPage,
        file: Arc<Inode>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        self.entries.lock().unwrap().insert(
            page,
            Spte::FileBacked {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            },
        );
    }

    pub fn add_mmap(
        &self,
        page: UserPage,
        mapid: u64,
        file: Arc<Inode>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) {
        self.entries.lock().unwrap().insert(
            page,
            Spte::MmapBacked {
                mapid,
                file,
                offset,
                read_bytes,
                zero_bytes,
            },
        );
    }

    /// Returns a clone of the entry for `page`, if one is recorded.
    pub fn find(&self, page: UserPage) -> Option<Spte> {
        self.entries.lock().unwrap().get(&page).cloned()
    }

    /// Removes and returns the entry for `page`.
    pub fn remove(&self, page: UserPage) -> Option<Spte> {
        self.entries.lock().unwrap().remove(&page)
    }

    /// Removes every SPTE belonging to `mapid`, returning their pages —
    /// used by `munmap` to drop the mapping's remaining absent pages.
    pub fn remove_mapping(&self, mapid: u64) -> Vec<UserPage> {
        let mut entries = self.entries.lock().unwrap();
        let pages: Vec<UserPage> = entries
            .iter()
            .filter(|(_, spte)| matches!(spte, Spte::MmapBacked { mapid: m, .. } if *m == mapid))
            .map(|(page, _)| *page)
            .collect();
        for page in &pages {
            entries.remove(page);
        }
        pages
    }

    /// On process teardown: every swap slot still referenced by a
    /// `Swapped` entry is returned so the caller can release it without
    /// I/O, and every entry is dropped.
    pub fn destroy(&self) -> Vec<SwapSlot> {
        let mut entries = self.entries.lock().unwrap();
        let slots = entries
            .values()
            .filter_map(|spte| match spte {
                Spte::Swapped { swap_slot, .. } => Some(*swap_slot),
                _ => None,
            })
            .collect();
        entries.clear();
        slots
    }
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}
