//! `mmap`/`munmap`: exposing a file's contents through the virtual-memory
//! system.
//!
//! Grounded on the original source's `userprog/syscall.c` `mmap`/`munmap`
//! (precondition checks, one `MmapBacked` SPTE per page, write-back-if-
//! -dirty on unmap) distilled into spec.md §4.7. The `fd`-to-`file`
//! resolution syscall.c does inline is out of this crate's scope (fd
//! marshalling is a non-goal); callers already hold the `Inode` to map.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::Cache;
use crate::device::Sector;
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::inode::InodeTable;
use crate::process::{MmapEntry, Process, ProcessTable, UserPage, PAGE_SIZE};
use crate::vm::frame::FrameTable;

/// Maps the file at `file_sector` into `owner`'s address space starting at
/// `addr`, one page per `MmapBacked` SPTE. Returns the new mapid.
///
/// Frames are not allocated here: each page stays absent until the first
/// fault reaches `FrameTable::load`, matching how every other SPTE variant
/// is populated lazily.
pub fn mmap(
    processes: &ProcessTable,
    frames: &FrameTable,
    cache: &Cache,
    freemap: &FreeMap,
    inodes: &InodeTable,
    owner: &Process,
    file_sector: Sector,
    addr: UserPage,
) -> Result<u64> {
    if addr == 0 || addr % PAGE_SIZE != 0 {
        return Err(Error::MmapPrecondition);
    }

    let file = inodes.open(cache, file_sector)?;
    let length = file.length();
    if length == 0 {
        inodes.close(cache, freemap, file)?;
        return Err(Error::MmapPrecondition);
    }

    let mapid = owner.next_mapid();
    let mut offset = 0u64;
    let mut page = addr;
    while offset < length {
        if owner.page_dir.get_frame(page).is_some() || owner.sup_page_table.find(page).is_some() {
            warn!("mmap: {page:#x} already mapped or covered by an SPTE, rolling back");
            let _ = munmap(processes, frames, cache, freemap, inodes, owner, mapid);
            return Err(Error::MmapPrecondition);
        }
        let read_bytes = ((length - offset).min(PAGE_SIZE)) as usize;
        let zero_bytes = PAGE_SIZE as usize - read_bytes;
        owner
            .sup_page_table
            .add_mmap(page, mapid, file.clone(), offset, read_bytes, zero_bytes);
        offset += PAGE_SIZE;
        page += PAGE_SIZE;
    }

    owner.mmaps.insert(mapid, MmapEntry { file });
    debug!("mmap: registered mapid {mapid} for {length} bytes at {addr:#x}");
    Ok(mapid)
}

/// Tears down mapping `mapid`: writes back dirty resident pages, frees
/// their frames, drops any still-absent SPTEs, and closes the reopened
/// file.
pub fn munmap(
    processes: &ProcessTable,
    frames: &FrameTable,
    cache: &Cache,
    freemap: &FreeMap,
    inodes: &InodeTable,
    owner: &Process,
    mapid: u64,
) -> Result<()> {
    for snapshot in frames.snapshot_mapping(owner.id, mapid) {
        let info = snapshot.mmap.expect("snapshot_mapping only returns mmap frames");
        if owner.page_dir.is_dirty(snapshot.page) {
            if let Some(content) = frames.content_of(snapshot.frame_id) {
                if let Some(file) = owner.mmaps.file(mapid) {
                    file.write_at(cache, freemap, &content[..info.read_bytes], info.read_bytes, info.offset)?;
                }
            }
        }
        owner.page_dir.clear_page(snapshot.page);
        frames.free_one(snapshot.frame_id);
    }

    owner.sup_page_table.remove_mapping(mapid);

    if let Some(entry) = owner.mmaps.remove(mapid) {
        close_mapping_file(cache, freemap, inodes, entry)?;
    }
    Ok(())
}

fn close_mapping_file(cache: &Cache, freemap: &FreeMap, inodes: &InodeTable, entry: MmapEntry) -> Result<()> {
    inodes.close(cache, freemap, entry.file)
}
