use super::bio::BufferCache;
use crate::{
    param::BSIZE,
    sync::sleeplock::{Sleeplock, SleeplockGuard},
};
use core::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

pub type BufData = [u8; BSIZE];

/// Index of a buffer slot within the cache's pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufId(pub(crate) usize);
impl fmt::Display for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// One slot of the buffer pool.
///
/// The identity fields (`dev`, `blockno`, `bktord`), `refcnt` and `pins` only
/// change while the owning bucket's lock is held. The eviction scan
/// peeks at `refcnt` and `tstamp` without any lock and rechecks under
/// the bucket lock before acting, which is why they are atomics.
pub struct Buffer {
    /// Has data been read from disk?
    pub(crate) valid: AtomicBool,
    pub(crate) dev: AtomicU32,
    pub(crate) blockno: AtomicU32,
    pub(crate) refcnt: AtomicU32,
    /// How many of the `refcnt` references were taken by `bpin`.
    pub(crate) pins: AtomicU32,
    /// Tick of the most recent access. Zero once the last reference
    /// is released, which makes the buffer the first to be recycled.
    pub(crate) tstamp: AtomicU64,
    /// Position of this buffer in its bucket's entry list.
    pub(crate) bktord: AtomicUsize,
    /// Guards the block contents and `valid`.
    pub(crate) lock: Sleeplock<BufData>,
}
impl Buffer {
    pub(crate) fn new(blockno: u32) -> Buffer {
        Buffer {
            valid: AtomicBool::new(false),
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(blockno),
            refcnt: AtomicU32::new(0),
            pins: AtomicU32::new(0),
            tstamp: AtomicU64::new(0),
            bktord: AtomicUsize::new(0),
            lock: Sleeplock::new("buffer", [0u8; BSIZE]),
        }
    }
    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Relaxed)
    }
    pub fn blockno(&self) -> u32 {
        self.blockno.load(Ordering::Relaxed)
    }
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }
    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Relaxed)
    }
    pub fn tstamp(&self) -> u64 {
        self.tstamp.load(Ordering::Relaxed)
    }
    pub(crate) fn holds(&self, dev: u32, blockno: u32) -> bool {
        self.dev() == dev && self.blockno() == blockno
    }
}
impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dev", &self.dev())
            .field("blockno", &self.blockno())
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .field("refcnt", &self.refcnt())
            .field("pins", &self.pins())
            .field("tstamp", &self.tstamp())
            .finish()
    }
}

/// A locked buffer, as handed out by [`BufferCache::bread`].
///
/// Holding a `Buf` means holding the buffer's sleep lock and one
/// reference to it. Dropping it is the same as passing it to
/// [`BufferCache::brelse`].
pub struct Buf<'a> {
    pub(crate) cache: &'a BufferCache,
    pub(crate) id: BufId,
    pub(crate) data: ManuallyDrop<SleeplockGuard<'a, BufData>>,
}
impl<'a> Buf<'a> {
    pub fn id(&self) -> BufId {
        self.id
    }
    pub fn dev(&self) -> u32 {
        self.buffer().dev()
    }
    pub fn blockno(&self) -> u32 {
        self.buffer().blockno()
    }
    pub(crate) fn buffer(&self) -> &'a Buffer {
        self.cache.buffer(self.id)
    }
}
impl<'a> Deref for Buf<'a> {
    type Target = BufData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if !self.buffer().lock.holding() {
            panic!("brelse");
        }
        // Safety: `data` is never touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release(self.id);
    }
}
impl<'a> fmt::Debug for Buf<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("id", &self.id)
            .field("dev", &self.dev())
            .field("blockno", &self.blockno())
            .finish()
    }
}
