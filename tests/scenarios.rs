//! Cross-module scenarios exercised end-to-end through `Kernel`, one per
//! spec.md §8 "Scenarios" entry.

use std::sync::Arc;

use vmfs_core::device::{BlockDevice, FileBlockDevice, MemBlockDevice};
use vmfs_core::kernel::{Config, Kernel, FIRST_DATA_SECTOR};
use vmfs_core::process::{Process, PAGE_SIZE};
use vmfs_core::vm::mmap::{mmap, munmap};

fn mem_kernel() -> Kernel {
    let fs: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(8192));
    let swap = Box::new(MemBlockDevice::new(64));
    Kernel::format(fs, swap, Config::default()).unwrap()
}

/// Scenario 1: create, write 1000 bytes, close, reopen, read back.
#[test]
fn scenario_1_write_close_reopen_round_trips() {
    let disk_dir = tempfile::tempdir().unwrap();
    let disk_path = disk_dir.path().join("fs.img");

    let fs: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::open(&disk_path, 8192).unwrap());
    let swap = Box::new(MemBlockDevice::new(64));
    let kernel = Kernel::format(fs, swap, Config::default()).unwrap();

    let sector = kernel
        .inodes
        .create(&kernel.cache, &kernel.freemap, 0, false, FIRST_DATA_SECTOR)
        .unwrap();
    let file_a = kernel.inodes.open(&kernel.cache, sector).unwrap();
    let payload = vec![0x41u8; 1000];
    let n = file_a.write_at(&kernel.cache, &kernel.freemap, &payload, 1000, 0).unwrap();
    assert_eq!(n, 1000);
    kernel.inodes.close(&kernel.cache, &kernel.freemap, file_a).unwrap();
    kernel.shutdown().unwrap();

    let fs2: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::open(&disk_path, 8192).unwrap());
    let swap2 = Box::new(MemBlockDevice::new(64));
    let remounted = Kernel::mount(fs2, swap2, Config::default()).unwrap();
    let reopened = remounted.inodes.open(&remounted.cache, sector).unwrap();
    let mut out = vec![0u8; 1000];
    let n = reopened.read_at(&remounted.cache, &mut out, 1000, 0).unwrap();
    assert_eq!(n, 1000);
    assert!(out.iter().all(|&b| b == 0x41));
}

/// Scenario 2: write past EOF zero-fills the gap.
#[test]
fn scenario_2_write_past_eof_zero_fills_gap() {
    let kernel = mem_kernel();
    let sector = kernel
        .inodes
        .create(&kernel.cache, &kernel.freemap, 0, false, FIRST_DATA_SECTOR)
        .unwrap();
    let file_b = kernel.inodes.open(&kernel.cache, sector).unwrap();

    file_b.write_at(&kernel.cache, &kernel.freemap, &[0xAA], 1, 600_000).unwrap();
    assert_eq!(file_b.length(), 600_001);

    let mut out = vec![0u8; 600_001];
    file_b.read_at(&kernel.cache, &mut out, 600_001, 0).unwrap();
    assert!(out[..600_000].iter().all(|&b| b == 0));
    assert_eq!(out[600_000], 0xAA);
}

/// Scenario 3: deny-write blocks writes without altering the file.
#[test]
fn scenario_3_deny_write_leaves_file_unchanged() {
    let kernel = mem_kernel();
    let sector = kernel
        .inodes
        .create(&kernel.cache, &kernel.freemap, 4, false, FIRST_DATA_SECTOR)
        .unwrap();
    let file_c = kernel.inodes.open(&kernel.cache, sector).unwrap();
    file_c.write_at(&kernel.cache, &kernel.freemap, &[1, 2, 3, 4], 4, 0).unwrap();

    file_c.deny_write();
    let n = file_c.write_at(&kernel.cache, &kernel.freemap, &[9, 9, 9, 9], 4, 0).unwrap();
    assert_eq!(n, 0);

    let mut out = [0u8; 4];
    file_c.read_at(&kernel.cache, &mut out, 4, 0).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

/// Scenario 4: mmap, dirty a page, munmap, reopen from disk — the
/// modification is visible.
#[test]
fn scenario_4_mmap_dirty_munmap_is_visible_after_reopen() {
    let disk_dir = tempfile::tempdir().unwrap();
    let disk_path = disk_dir.path().join("fs.img");

    let fs: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::open(&disk_path, 8192).unwrap());
    let swap = Box::new(MemBlockDevice::new(64));
    let kernel = Kernel::format(fs, swap, Config::default()).unwrap();

    let sector = kernel
        .inodes
        .create(&kernel.cache, &kernel.freemap, 3 * PAGE_SIZE, false, FIRST_DATA_SECTOR)
        .unwrap();
    let process = Process::new(1);
    kernel.processes.insert(process.clone());

    let addr = 0x40_0000u64;
    let mapid = mmap(
        &kernel.processes,
        &kernel.frames,
        &kernel.cache,
        &kernel.freemap,
        &kernel.inodes,
        &process,
        sector,
        addr,
    )
    .unwrap();

    let middle_page = addr + PAGE_SIZE;
    assert!(kernel
        .frames
        .load(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, middle_page)
        .unwrap());
    let frame_id = process.page_dir.get_frame(middle_page).unwrap();
    kernel.frames.with_content_mut(frame_id, |buf| buf[42] = 0x77).unwrap();
    process.page_dir.mark_dirty(middle_page);

    munmap(&kernel.processes, &kernel.frames, &kernel.cache, &kernel.freemap, &kernel.inodes, &process, mapid).unwrap();
    kernel.shutdown().unwrap();

    let fs2: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::open(&disk_path, 8192).unwrap());
    let swap2 = Box::new(MemBlockDevice::new(64));
    let remounted = Kernel::mount(fs2, swap2, Config::default()).unwrap();
    let reopened = remounted.inodes.open(&remounted.cache, sector).unwrap();
    let mut out = vec![0u8; PAGE_SIZE as usize];
    reopened
        .read_at(&remounted.cache, &mut out, PAGE_SIZE as usize, PAGE_SIZE)
        .unwrap();
    assert_eq!(out[42], 0x77);
}

/// Scenario 5: eviction under pressure produces a `Swapped` SPTE, and a
/// later access transparently reloads it with identical content.
#[test]
fn scenario_5_eviction_then_access_reloads_transparently() {
    let fs: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(8192));
    let swap_dev = Box::new(MemBlockDevice::new(64));
    let mut config = Config::default();
    config.frame_capacity = 1;
    let kernel = Kernel::format(fs, swap_dev, config).unwrap();

    let process = Process::new(7);
    kernel.processes.insert(process.clone());

    let page_one = 0x8000u64;
    let frame_id = kernel
        .frames
        .alloc(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, page_one, true)
        .unwrap();
    kernel.frames.with_content_mut(frame_id, |buf| buf.fill(0x5C)).unwrap();
    process.page_dir.set_accessed(page_one, false);

    // Forces eviction of page_one (capacity 1).
    let page_two = 0x9000u64;
    kernel
        .frames
        .alloc(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, page_two, true)
        .unwrap();

    assert!(process.page_dir.get_frame(page_one).is_none());
    assert!(matches!(
        process.sup_page_table.find(page_one),
        Some(vmfs_core::vm::spte::Spte::Swapped { .. })
    ));

    kernel.frames.free_all(&kernel.processes, process.id);
    let loaded = kernel
        .frames
        .load(&kernel.processes, &kernel.cache, &kernel.freemap, &kernel.swap, &process, page_one)
        .unwrap();
    assert!(loaded);
    let reloaded_frame = process.page_dir.get_frame(page_one).unwrap();
    let content = kernel.frames.content_of(reloaded_frame).unwrap();
    assert!(content.iter().all(|&b| b == 0x5C));
}

/// Scenario 6: removing an open file keeps the live handle usable; its
/// sectors return to the free-map only after the final close.
#[test]
fn scenario_6_remove_open_file_frees_on_final_close() {
    let kernel = mem_kernel();
    let before = kernel.freemap.free_count();

    let sector = kernel
        .inodes
        .create(&kernel.cache, &kernel.freemap, 2000, false, FIRST_DATA_SECTOR)
        .unwrap();
    let handle_a = kernel.inodes.open(&kernel.cache, sector).unwrap();
    let handle_b = kernel.inodes.open(&kernel.cache, sector).unwrap();
    handle_a.mark_removed();

    // Still open: reads on the surviving handle keep working.
    let mut out = vec![0u8; 2000];
    let n = handle_b.read_at(&kernel.cache, &mut out, 2000, 0).unwrap();
    assert_eq!(n, 2000);

    kernel.inodes.close(&kernel.cache, &kernel.freemap, handle_a).unwrap();
    assert!(kernel.freemap.free_count() < before, "sectors freed too early");

    kernel.inodes.close(&kernel.cache, &kernel.freemap, handle_b).unwrap();
    assert_eq!(kernel.freemap.free_count(), before);
}
