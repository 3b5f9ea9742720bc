//! Storage drivers the buffer cache reads and writes through.

pub mod ramdisk;

use crate::io::buf::BufData;
use std::sync::Arc;

pub use ramdisk::Ramdisk;

/// A block device driver.
///
/// `rw` is synchronous: it returns only once the transfer is complete.
/// On a read it fills `data` from block `blockno` of device `dev`; on a
/// write it persists `data` there. Failures are the driver's concern and
/// are not reported to the cache.
pub trait BlockDevice: Send + Sync {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool);
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool) {
        (**self).rw(dev, blockno, data, write)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, write: bool) {
        (**self).rw(dev, blockno, data, write)
    }
}
