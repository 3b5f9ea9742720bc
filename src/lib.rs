//! Resource-management core of a small multiprocessor kernel:
//! a bucketed disk-block buffer cache and a reference-counted
//! physical page allocator.
//!
//! Both live inside a [`Kernel`], built once at startup and shared by
//! every thread that needs them.

pub mod hardware;
pub mod io;
pub mod mem;
pub mod param;
pub mod sync;

use crate::{
    hardware::BlockDevice,
    io::bio::BufferCache,
    mem::{
        kalloc::{Kmem, KmemError},
        PhysAddr,
    },
    param::{KERNBASE, PHYSTOP},
};
use std::sync::Arc;
use tracing::info;

pub use crate::{
    io::{Buf, BufData, BufId},
    mem::PGSIZE,
};

/// Where the page allocator's memory lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// First byte of physical memory handed to the page allocator.
    /// Rounded up to a page boundary.
    pub phys_start: PhysAddr,
    /// End of physical memory handed to the page allocator.
    pub phys_stop: PhysAddr,
}
impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            phys_start: PhysAddr(KERNBASE),
            phys_stop: PhysAddr(PHYSTOP),
        }
    }
}

pub struct Kernel {
    pub kmem: Kmem,
    pub bcache: BufferCache,
}
impl Kernel {
    /// Bring up the page allocator, then the buffer cache over `disk`.
    pub fn new(config: KernelConfig, disk: Arc<dyn BlockDevice>) -> Result<Kernel, KmemError> {
        info!("kernel core is booting");
        let kmem = Kmem::new(config.phys_start, config.phys_stop)?;
        let bcache = BufferCache::new(disk);
        Ok(Kernel { kmem, bcache })
    }
}
impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("kmem", &self.kmem)
            .field("bcache", &self.bcache.stats())
            .finish()
    }
}
