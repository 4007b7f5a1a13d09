//! Periodic write-behind: flushes dirty cache entries on a timer instead of
//! only on explicit close/shutdown.
//!
//! Grounded on the original source's `filesys/cache.c` `write_behind_thread`
//! (sleep, flush, repeat, forever, until the owning thread is killed at
//! shutdown). There is no `thread_create`-and-forget here — the handle is
//! joined on drop, the way `kaist-cp-rv6/kernel-rs/src/kernel.rs` owns its
//! background kernel threads rather than leaking them.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, trace};

use crate::cache::Cache;

/// A running write-behind task. Dropping it signals the background thread
/// to stop and joins it.
pub struct WriteBehind {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBehind {
    /// Spawns a thread that calls `cache.flush(false)` every `interval`
    /// until dropped.
    pub fn spawn(cache: Arc<Cache>, interval: Duration) -> Self {
        let (shutdown, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    trace!("writeback: shutting down");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = cache.flush(false) {
                        error!("writeback: flush failed: {e}");
                    }
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn flushes_dirty_entries_on_a_timer() {
        let device = Arc::new(MemBlockDevice::new(2));
        let cache = Arc::new(Cache::new(device.clone()));
        cache.write_at(0, &[9u8; 4], 4, 0).unwrap();

        let task = WriteBehind::spawn(cache.clone(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        drop(task);

        let mut raw = [0u8; crate::device::SECTOR_SIZE];
        device.read_sector(0, &mut raw).unwrap();
        assert_eq!(&raw[..4], &[9u8; 4]);
    }

    #[test]
    fn drop_joins_without_blocking_forever() {
        let cache = Arc::new(Cache::new(Arc::new(MemBlockDevice::new(1))));
        let task = WriteBehind::spawn(cache, Duration::from_secs(3600));
        drop(task);
    }
}
