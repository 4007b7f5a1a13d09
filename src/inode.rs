//! Extensible inode layer.
//!
//! On-disk layout, sector translation, and growth are grounded on the
//! original source's `filesys/inode.c` (`byte_to_sector`, `inode_expand`,
//! `inode_single_block_expand`, `inode_close`'s free-on-remove walk). The
//! in-memory side — an `Arc`-shared handle refcounted by `open_count`,
//! looked up through a table keyed by sector — follows rv6's
//! `fs/ufs/inode.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::device::{Sector, INVALID_SECTOR, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::freemap::FreeMap;

/// Number of direct sector pointers (spec.md §3/§6).
pub const DIRECT_BLOCK_COUNT: usize = 1;
/// Number of sector pointers per indirect block.
pub const INDIRECT_PTRS: usize = 128;
/// Magic number stamped into every on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;
/// Maximum representable file size, per spec.md §3: `(1 + 128 + 128*128) * 512`.
pub const MAX_FILE_SIZE: u64 = (1 + INDIRECT_PTRS as u64 + (INDIRECT_PTRS * INDIRECT_PTRS) as u64)
    * SECTOR_SIZE as u64;

/// On-disk inode: exactly one sector. Field order and padding follow
/// spec.md §6's byte layout exactly.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct RawInode {
    pub direct_sector: u32,
    pub single_indirect_sector: u32,
    pub double_indirect_sector: u32,
    pub length: i32,
    pub magic: u32,
    pub is_dir: u8,
    _pad0: [u8; 3],
    pub parent_sector: u32,
    _reserved: [u8; 484],
}

const_assert_eq!(std::mem::size_of::<RawInode>(), SECTOR_SIZE);

impl RawInode {
    fn zeroed() -> Self {
        RawInode {
            direct_sector: INVALID_SECTOR,
            single_indirect_sector: INVALID_SECTOR,
            double_indirect_sector: INVALID_SECTOR,
            length: 0,
            magic: INODE_MAGIC,
            is_dir: 0,
            _pad0: [0; 3],
            parent_sector: 0,
            _reserved: [0; 484],
        }
    }

    fn read_from_cache(cache: &Cache, sector: Sector) -> Result<Self> {
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read_at(sector, &mut buf, SECTOR_SIZE, 0)?;
        RawInode::read_from(&buf[..]).ok_or_else(|| Error::Io("corrupt inode sector".into()))
    }

    fn write_to_cache(&self, cache: &Cache, sector: Sector) -> Result<()> {
        cache.write_at(sector, self.as_bytes(), SECTOR_SIZE, 0)?;
        Ok(())
    }
}

/// One level of index indirection: 128 sector pointers filling a sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndirectBlock {
    pt: [u32; INDIRECT_PTRS],
}

const_assert_eq!(std::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        IndirectBlock {
            pt: [INVALID_SECTOR; INDIRECT_PTRS],
        }
    }

    fn read_from_cache(cache: &Cache, sector: Sector) -> Result<Self> {
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read_at(sector, &mut buf, SECTOR_SIZE, 0)?;
        IndirectBlock::read_from(&buf[..]).ok_or_else(|| Error::Io("corrupt indirect block".into()))
    }

    fn write_to_cache(&self, cache: &Cache, sector: Sector) -> Result<()> {
        cache.write_at(sector, self.as_bytes(), SECTOR_SIZE, 0)?;
        Ok(())
    }
}

/// Resolves byte offset `pos` (which must be `< data.length`) to a data
/// sector, reading index blocks through `cache` as needed.
fn byte_to_sector(data: &RawInode, cache: &Cache, pos: u64) -> Result<Sector> {
    if pos >= data.length as u64 {
        return Ok(INVALID_SECTOR);
    }
    let index = (pos / SECTOR_SIZE as u64) as usize;
    if index < DIRECT_BLOCK_COUNT {
        return Ok(data.direct_sector);
    }
    if index < DIRECT_BLOCK_COUNT + INDIRECT_PTRS {
        let block = IndirectBlock::read_from_cache(cache, data.single_indirect_sector)?;
        return Ok(block.pt[index - DIRECT_BLOCK_COUNT]);
    }
    let rest = index - DIRECT_BLOCK_COUNT - INDIRECT_PTRS;
    let d_index = rest / INDIRECT_PTRS;
    let s_index = rest % INDIRECT_PTRS;
    let d_block = IndirectBlock::read_from_cache(cache, data.double_indirect_sector)?;
    let s_block = IndirectBlock::read_from_cache(cache, d_block.pt[d_index])?;
    Ok(s_block.pt[s_index])
}

/// Allocates and zeroes exactly one new data sector, extending `data` by
/// `size` bytes (`size <= SECTOR_SIZE`), first growing whichever index
/// level the new sector crosses into. Mirrors `inode_single_block_expand`.
fn expand_one_sector(data: &mut RawInode, cache: &Cache, freemap: &FreeMap, size: usize) -> Result<()> {
    debug_assert_eq!(data.length as u64 % SECTOR_SIZE as u64, 0);
    let index = data.length as u64 / SECTOR_SIZE as u64;
    let index = index as usize;

    let new_sector = if index < DIRECT_BLOCK_COUNT {
        let sector = freemap.allocate(cache, 1)?;
        data.direct_sector = sector;
        sector
    } else if index < DIRECT_BLOCK_COUNT + INDIRECT_PTRS {
        let slot = index - DIRECT_BLOCK_COUNT;
        let mut block = if slot == 0 {
            let sector = freemap.allocate(cache, 1)?;
            data.single_indirect_sector = sector;
            IndirectBlock::zeroed()
        } else {
            IndirectBlock::read_from_cache(cache, data.single_indirect_sector)?
        };
        let sector = freemap.allocate(cache, 1)?;
        block.pt[slot] = sector;
        block.write_to_cache(cache, data.single_indirect_sector)?;
        sector
    } else {
        let rest = index - DIRECT_BLOCK_COUNT - INDIRECT_PTRS;
        let d_index = rest / INDIRECT_PTRS;
        let s_index = rest % INDIRECT_PTRS;

        let mut d_block = if rest == 0 {
            let sector = freemap.allocate(cache, 1)?;
            data.double_indirect_sector = sector;
            IndirectBlock::zeroed()
        } else {
            IndirectBlock::read_from_cache(cache, data.double_indirect_sector)?
        };

        let mut s_block = if s_index == 0 {
            let sector = freemap.allocate(cache, 1)?;
            d_block.pt[d_index] = sector;
            IndirectBlock::zeroed()
        } else {
            IndirectBlock::read_from_cache(cache, d_block.pt[d_index])?
        };

        let sector = freemap.allocate(cache, 1)?;
        s_block.pt[s_index] = sector;
        s_block.write_to_cache(cache, d_block.pt[d_index])?;
        d_block.write_to_cache(cache, data.double_indirect_sector)?;
        sector
    };

    let zeros = [0u8; SECTOR_SIZE];
    cache.write_at(new_sector, &zeros[..size], size, 0)?;
    data.length += size as i32;
    Ok(())
}

/// Grows `data` by `delta` bytes: zero-fills the tail gap in the current
/// last sector, then allocates one sector at a time. Matches
/// `inode_expand`'s no-rollback-on-failure semantics (spec.md §9): a
/// mid-expansion allocation failure leaves `data.length` reflecting
/// whatever was already committed.
fn expand(data: &mut RawInode, cache: &Cache, freemap: &FreeMap, delta: u64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let mut remaining = delta;

    let tail = data.length as u64 % SECTOR_SIZE as u64;
    if tail != 0 {
        let gap = SECTOR_SIZE as u64 - tail;
        let fill = remaining.min(gap);
        let sector = byte_to_sector(data, cache, data.length as u64 - 1)?;
        let zeros = vec![0u8; fill as usize];
        cache.write_at(sector, &zeros, fill as usize, tail as usize)?;
        data.length += fill as i32;
        remaining -= fill;
    }

    while remaining > 0 {
        let chunk = remaining.min(SECTOR_SIZE as u64);
        expand_one_sector(data, cache, freemap, chunk as usize)?;
        remaining -= chunk;
    }
    Ok(())
}

struct InodeState {
    data: RawInode,
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// A shared, refcounted handle to an open file's inode.
pub struct Inode {
    pub sector: Sector,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Current file length in bytes.
    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().data.length as u64
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().unwrap().data.is_dir != 0
    }

    pub fn parent_sector(&self) -> Sector {
        self.state.lock().unwrap().data.parent_sector
    }

    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Disables writes; may be called once per opener (spec.md §4.2).
    pub fn deny_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.deny_write_count += 1;
        debug_assert!(state.deny_write_count <= state.open_count);
    }

    /// Re-enables writes; must be paired with a prior `deny_write`.
    pub fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    /// Reads up to `size` bytes at `offset` into `dst`, clamped to EOF.
    /// Returns the number of bytes actually read.
    pub fn read_at(&self, cache: &Cache, dst: &mut [u8], size: usize, offset: u64) -> Result<usize> {
        let state = self.state.lock().unwrap();
        let data = state.data;
        drop(state);

        let mut bytes_read = 0usize;
        let mut offset = offset;
        let mut remaining = size;
        while remaining > 0 {
            let sector = byte_to_sector(&data, cache, offset)?;
            if sector == INVALID_SECTOR {
                break;
            }
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
            let inode_left = (data.length as u64).saturating_sub(offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(sector_left).min(inode_left);
            if chunk == 0 {
                break;
            }
            cache.read_at(sector, &mut dst[bytes_read..bytes_read + chunk], chunk, sector_ofs)?;
            bytes_read += chunk;
            offset += chunk as u64;
            remaining -= chunk;
        }
        Ok(bytes_read)
    }

    /// Writes up to `size` bytes from `src` at `offset`, growing the file
    /// first if `offset + size` exceeds the current length. Returns 0
    /// immediately if writes are currently denied.
    pub fn write_at(
        &self,
        cache: &Cache,
        freemap: &FreeMap,
        src: &[u8],
        size: usize,
        offset: u64,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.deny_write_count > 0 {
            return Ok(0);
        }

        let end = offset + size as u64;
        if end > state.data.length as u64 {
            let delta = end - state.data.length as u64;
            expand(&mut state.data, cache, freemap, delta)?;
        }
        let data = state.data;
        drop(state);

        let mut bytes_written = 0usize;
        let mut offset = offset;
        let mut remaining = size;
        while remaining > 0 {
            let sector = byte_to_sector(&data, cache, offset)?;
            if sector == INVALID_SECTOR {
                break;
            }
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
            let inode_left = (data.length as u64).saturating_sub(offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(sector_left).min(inode_left);
            if chunk == 0 {
                break;
            }
            cache.write_at(sector, &src[bytes_written..bytes_written + chunk], chunk, sector_ofs)?;
            bytes_written += chunk;
            offset += chunk as u64;
            remaining -= chunk;
        }
        Ok(bytes_written)
    }
}

/// Process-wide (or test-wide) registry of open inodes, keyed by sector, so
/// that opening the same file twice shares one handle (spec.md §4.2).
pub struct InodeTable {
    open: Mutex<HashMap<Sector, Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a zeroed on-disk inode of the requested initial length and
    /// writes it to a fresh sector. Returns that sector.
    pub fn create(
        &self,
        cache: &Cache,
        freemap: &FreeMap,
        length: u64,
        is_dir: bool,
        parent_sector: Sector,
    ) -> Result<Sector> {
        let sector = freemap.allocate(cache, 1)?;
        let mut data = RawInode::zeroed();
        if let Err(e) = expand(&mut data, cache, freemap, length) {
            freemap.release(cache, sector, 1)?;
            return Err(e);
        }
        data.is_dir = is_dir as u8;
        data.parent_sector = parent_sector;
        data.write_to_cache(cache, sector)?;
        debug!("inode: created sector {sector} with length {length}");
        Ok(sector)
    }

    /// Opens the inode at `sector`, sharing the existing handle if it is
    /// already open.
    pub fn open(&self, cache: &Cache, sector: Sector) -> Result<Arc<Inode>> {
        let mut open = self.open.lock().unwrap();
        if let Some(inode) = open.get(&sector) {
            inode.state.lock().unwrap().open_count += 1;
            return Ok(inode.clone());
        }
        let data = RawInode::read_from_cache(cache, sector)?;
        if data.magic != INODE_MAGIC {
            return Err(Error::Io(format!("bad inode magic at sector {sector}")));
        }
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                data,
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
        });
        open.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Decrements `inode`'s open count; on reaching zero, writes it back
    /// and, if marked removed, frees its data sectors and its own sector.
    pub fn close(&self, cache: &Cache, freemap: &FreeMap, inode: Arc<Inode>) -> Result<()> {
        let mut open = self.open.lock().unwrap();
        let (should_destroy, data, removed) = {
            let mut state = inode.state.lock().unwrap();
            state.open_count -= 1;
            (state.open_count == 0, state.data, state.removed)
        };
        if !should_destroy {
            return Ok(());
        }
        open.remove(&inode.sector);
        drop(open);

        data.write_to_cache(cache, inode.sector)?;
        if removed {
            self.free_data_sectors(cache, freemap, &data)?;
            freemap.release(cache, inode.sector, 1)?;
        }
        trace!("inode: closed and destroyed sector {}", inode.sector);
        Ok(())
    }

    /// Walks direct → single-indirect → double-indirect data sectors up to
    /// the recorded length, freeing each via the cache and the free-map.
    /// Matches `inode_close`'s removal walk: index blocks themselves are
    /// not freed, which is inherited from the original and accepted by
    /// spec.md §4.2 (the walk only names data sectors).
    fn free_data_sectors(&self, cache: &Cache, freemap: &FreeMap, data: &RawInode) -> Result<()> {
        let mut remaining = data.length as i64;
        let mut index = 0usize;

        while remaining > 0 && index < DIRECT_BLOCK_COUNT {
            self.free_one(cache, freemap, data.direct_sector)?;
            index += 1;
            remaining -= SECTOR_SIZE as i64;
        }

        let mut index = 0usize;
        let mut block: Option<IndirectBlock> = None;
        while remaining > 0 && index < INDIRECT_PTRS {
            if index == 0 {
                block = Some(IndirectBlock::read_from_cache(cache, data.single_indirect_sector)?);
            }
            let sector = block.unwrap().pt[index];
            self.free_one(cache, freemap, sector)?;
            index += 1;
            remaining -= SECTOR_SIZE as i64;
        }

        let mut index = 0usize;
        let mut d_block: Option<IndirectBlock> = None;
        let mut s_block: Option<IndirectBlock> = None;
        while remaining > 0 {
            if index == 0 {
                d_block = Some(IndirectBlock::read_from_cache(cache, data.double_indirect_sector)?);
            }
            if index % INDIRECT_PTRS == 0 {
                let d = d_block.unwrap();
                s_block = Some(IndirectBlock::read_from_cache(cache, d.pt[index / INDIRECT_PTRS])?);
            }
            let sector = s_block.unwrap().pt[index % INDIRECT_PTRS];
            self.free_one(cache, freemap, sector)?;
            index += 1;
            remaining -= SECTOR_SIZE as i64;
        }
        Ok(())
    }

    fn free_one(&self, cache: &Cache, freemap: &FreeMap, sector: Sector) -> Result<()> {
        cache.free(sector);
        freemap.release(cache, sector, 1)
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
