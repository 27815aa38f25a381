//! Disk driver seam.
//!
//! The cache delegates all real I/O to a [`DiskDriver`]. Transfers are
//! synchronous: the call returns only once the payload has been filled
//! (read) or flushed (write). A driver never fails silently; an
//! unrecoverable device error is the driver's own fatal condition, not an
//! error the cache models.

use ck_types::{BlockNumber, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Direction of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDir {
    Read,
    Write,
}

/// Synchronous block transfer contract.
pub trait DiskDriver: Send + Sync {
    /// Move one block between `payload` and the device.
    ///
    /// On [`TransferDir::Read`], fills `payload` with the block's on-disk
    /// content; on [`TransferDir::Write`], flushes `payload` to disk. May
    /// block the caller until the I/O completes.
    fn transfer(&self, dev: DeviceId, block: BlockNumber, payload: &mut [u8], dir: TransferDir);
}

/// File-backed disk using `pread`/`pwrite` style positioned I/O.
///
/// Backs a single device; the `DeviceId` is accepted and ignored. Uses
/// `std::os::unix::fs::FileExt`, which is thread-safe and does not require
/// a shared seek position.
#[derive(Debug, Clone)]
pub struct FileDisk {
    file: Arc<File>,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl DiskDriver for FileDisk {
    fn transfer(&self, _dev: DeviceId, block: BlockNumber, payload: &mut [u8], dir: TransferDir) {
        let len = u64::try_from(payload.len()).expect("block size fits in u64");
        let offset = block
            .0
            .checked_mul(len)
            .expect("block byte offset overflows u64");
        match dir {
            TransferDir::Read => self
                .file
                .read_exact_at(payload, offset)
                .expect("disk read failed"),
            TransferDir::Write => self
                .file
                .write_all_at(payload, offset)
                .expect("disk write failed"),
        }
    }
}

/// In-memory disk for tests, benches, and the demo CLI.
///
/// Tracks per-block read counts so tests can assert how many times the
/// cache actually went to the device.
#[derive(Debug, Default)]
pub struct MemDisk {
    blocks: Mutex<HashMap<(DeviceId, BlockNumber), Vec<u8>>>,
    read_counts: Mutex<HashMap<(DeviceId, BlockNumber), u64>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a block's on-disk content.
    pub fn preload(&self, dev: DeviceId, block: BlockNumber, data: &[u8]) {
        self.blocks.lock().insert((dev, block), data.to_vec());
    }

    /// Total read transfers served.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total write transfers served.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Read transfers served for one specific block.
    #[must_use]
    pub fn reads_for(&self, dev: DeviceId, block: BlockNumber) -> u64 {
        self.read_counts
            .lock()
            .get(&(dev, block))
            .copied()
            .unwrap_or(0)
    }
}

impl DiskDriver for MemDisk {
    fn transfer(&self, dev: DeviceId, block: BlockNumber, payload: &mut [u8], dir: TransferDir) {
        match dir {
            TransferDir::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                *self.read_counts.lock().entry((dev, block)).or_insert(0) += 1;
                let blocks = self.blocks.lock();
                if let Some(data) = blocks.get(&(dev, block)) {
                    let n = data.len().min(payload.len());
                    payload[..n].copy_from_slice(&data[..n]);
                    payload[n..].fill(0);
                } else {
                    payload.fill(0);
                }
            }
            TransferDir::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.blocks.lock().insert((dev, block), payload.to_vec());
            }
        }
    }
}
