//! Ramdisk that keeps every block in memory.
//!
//! Stands in for the virtio disk when the cache runs hosted, and
//! counts every request so callers can see how often the cache
//! actually reached the device.

use super::BlockDevice;
use crate::{io::buf::BufData, param::BSIZE, sync::spinlock::Spinlock};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};
use tracing::{error, trace};

pub struct Ramdisk {
    /// Blocks per device.
    nblocks: u32,
    /// Blocks that have been written at least once.
    /// Anything missing reads back as zeroes.
    blocks: Spinlock<HashMap<(u32, u32), Box<BufData>>>,
    /// Simulated time to complete one request.
    latency: Option<Duration>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}
impl Ramdisk {
    pub fn new(nblocks: u32) -> Ramdisk {
        Ramdisk {
            nblocks,
            blocks: Spinlock::new("ramdisk", HashMap::new()),
            latency: None,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
    /// Make every request take at least `latency`, as a real disk would.
    pub fn with_latency(mut self, latency: Duration) -> Ramdisk {
        self.latency = Some(latency);
        self
    }
    /// Number of read requests served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
    /// Number of write requests served.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
    /// Copy of a block's current on-disk contents, bypassing any cache.
    pub fn peek(&self, dev: u32, blockno: u32) -> BufData {
        self.blocks
            .lock()
            .get(&(dev, blockno))
            .map(|block| **block)
            .unwrap_or([0u8; BSIZE])
    }
}
impl BlockDevice for Ramdisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool) {
        if blockno >= self.nblocks {
            error!(dev, blockno, nblocks = self.nblocks, "ramdisk request past end of disk");
            panic!("ramdiskrw: blockno out of range");
        }
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }

        let mut blocks = self.blocks.lock();
        if write {
            trace!(dev, blockno, "ramdisk write");
            self.writes.fetch_add(1, Ordering::SeqCst);
            blocks.insert((dev, blockno), Box::new(*data));
        } else {
            trace!(dev, blockno, "ramdisk read");
            self.reads.fetch_add(1, Ordering::SeqCst);
            match blocks.get(&(dev, blockno)) {
                Some(block) => data.copy_from_slice(&block[..]),
                None => data.fill(0),
            }
        }
    }
}
