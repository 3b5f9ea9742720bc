//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages,
//! and pipe buffers. Allocates whole 4096-byte pages.
//!
//! Every page carries a reference count so one physical page can be
//! mapped by several address spaces at once. A page returns to the
//! free list only when its last reference is dropped.
//!
//! The free list and the reference counts have separate locks. No
//! operation needs both at once; they are always taken one after
//! the other.

use super::{pg_round_up, PhysAddr, PGSIZE};
use crate::sync::spinlock::{Spinlock, SpinlockGuard};
use core::fmt;
use thiserror::Error;
use tracing::{debug, error, info};

pub type PageData = [u8; PGSIZE];

/// Written over a page when it goes back on the free list.
const JUNK_FREE: u8 = 1;
/// Written over a page when it is handed out.
#[cfg(feature = "junk-fill")]
const JUNK_ALLOC: u8 = 5;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KmemError {
    #[error("physical range {start}..{end} does not hold a whole page")]
    EmptyRange { start: PhysAddr, end: PhysAddr },
}

/// Singly linked list of free pages, linked by page index.
struct FreeList {
    head: Option<usize>,
    next: Box<[Option<usize>]>,
    len: usize,
}
impl FreeList {
    fn new(npages: usize) -> FreeList {
        FreeList {
            head: None,
            next: vec![None; npages].into_boxed_slice(),
            len: 0,
        }
    }
    fn push(&mut self, idx: usize) {
        self.next[idx] = self.head;
        self.head = Some(idx);
        self.len += 1;
    }
    fn pop(&mut self) -> Option<usize> {
        let idx = self.head?;
        self.head = self.next[idx].take();
        self.len -= 1;
        Some(idx)
    }
}

pub struct Kmem {
    /// Address of the first managed page.
    base: usize,
    frames: Box<[Spinlock<Box<PageData>>]>,
    freelist: Spinlock<FreeList>,
    /// Owners of each page, indexed like `frames`.
    refcnt: Spinlock<Box<[u32]>>,
}
impl Kmem {
    /// Manage every whole page in `[pa_start, pa_end)`.
    ///
    /// All of them start out on the free list.
    pub fn new(pa_start: PhysAddr, pa_end: PhysAddr) -> Result<Kmem, KmemError> {
        let base = pg_round_up(pa_start.as_usize());
        let npages = pa_end.as_usize().saturating_sub(base) / PGSIZE;
        if npages == 0 {
            return Err(KmemError::EmptyRange {
                start: pa_start,
                end: pa_end,
            });
        }

        let kmem = Kmem {
            base,
            frames: (0..npages)
                .map(|_| Spinlock::new("page", Box::new([0u8; PGSIZE])))
                .collect(),
            freelist: Spinlock::new("kmem", FreeList::new(npages)),
            refcnt: Spinlock::new("kmemref", vec![0; npages].into_boxed_slice()),
        };
        kmem.freerange();
        info!(
            base = %PhysAddr(base),
            end = %kmem.end(),
            npages,
            "page allocator initialized"
        );
        Ok(kmem)
    }

    fn freerange(&self) {
        for idx in 0..self.npages() {
            self.refcnt.lock()[idx] = 1;
            self.kfree(self.addr(idx));
        }
    }

    pub fn npages(&self) -> usize {
        self.frames.len()
    }
    pub fn base(&self) -> PhysAddr {
        PhysAddr(self.base)
    }
    /// First address past the managed range.
    pub fn end(&self) -> PhysAddr {
        PhysAddr(self.base + self.npages() * PGSIZE)
    }
    /// Number of pages on the free list.
    pub fn nfree(&self) -> usize {
        self.freelist.lock().len
    }

    fn addr(&self, idx: usize) -> PhysAddr {
        PhysAddr(self.base + idx * PGSIZE)
    }

    /// Page index of `pa`, which must be a page-aligned address
    /// inside the managed range.
    fn index(&self, pa: PhysAddr, caller: &'static str) -> usize {
        if !pa.is_page_aligned() || pa < self.base() || pa >= self.end() {
            error!(%pa, base = %self.base(), end = %self.end(), "{caller}: bad physical address");
            panic!("{}", caller);
        }
        (pa.as_usize() - self.base) / PGSIZE
    }

    /// Drop one reference to the page at `pa`, which normally should
    /// have been returned by a call to kalloc(). The page goes back on
    /// the free list once nobody references it.
    pub fn kfree(&self, pa: PhysAddr) {
        let idx = self.index(pa, "kfree");

        {
            let mut refcnt = self.refcnt.lock();
            if refcnt[idx] == 0 {
                error!(%pa, "page freed with no references");
                panic!("kfree: double free");
            }
            refcnt[idx] -= 1;
            if refcnt[idx] > 0 {
                return;
            }
        }

        // Fill with junk to catch dangling refs.
        self.frames[idx].lock().fill(JUNK_FREE);

        self.freelist.lock().push(idx);
        debug!(%pa, "page reclaimed");
    }

    /// Allocate one 4096-byte page of physical memory.
    ///
    /// The page comes back with a reference count of 1.
    /// Returns `None` if no memory is left.
    pub fn kalloc(&self) -> Option<PhysAddr> {
        let Some(idx) = self.freelist.lock().pop() else {
            debug!("out of physical pages");
            return None;
        };
        self.refcnt.lock()[idx] = 1;

        #[cfg(feature = "junk-fill")]
        self.frames[idx].lock().fill(JUNK_ALLOC);

        Some(self.addr(idx))
    }

    /// Record another owner of the page at `pa`.
    pub fn kaddref(&self, pa: PhysAddr) {
        let idx = self.index(pa, "kaddref");
        let mut refcnt = self.refcnt.lock();
        if refcnt[idx] == 0 {
            error!(%pa, "reference taken on a free page");
            panic!("kaddref: free page");
        }
        refcnt[idx] += 1;
    }

    /// Number of owners of the page at `pa`.
    pub fn kgetref(&self, pa: PhysAddr) -> u32 {
        let idx = self.index(pa, "kgetref");
        self.refcnt.lock()[idx]
    }

    /// The contents of the page at `pa`.
    pub fn frame(&self, pa: PhysAddr) -> SpinlockGuard<'_, Box<PageData>> {
        let idx = self.index(pa, "frame");
        self.frames[idx].lock()
    }

    /// Give the caller a page it can write without disturbing other owners.
    ///
    /// A page with a single owner is returned as it is. Otherwise the
    /// contents are copied into a fresh page and the caller's reference
    /// to the shared one is dropped. Returns `None` if no page is free
    /// for the copy, in which case the caller still owns `pa`.
    pub fn copy_on_write(&self, pa: PhysAddr) -> Option<PhysAddr> {
        if self.kgetref(pa) == 1 {
            return Some(pa);
        }
        let copy = self.kalloc()?;
        let src: PageData = **self.frame(pa);
        self.frame(copy).copy_from_slice(&src);
        self.kfree(pa);
        debug!(%pa, %copy, "page unshared");
        Some(copy)
    }
}
impl fmt::Debug for Kmem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kmem")
            .field("base", &self.base())
            .field("npages", &self.npages())
            .field("nfree", &self.nfree())
            .finish()
    }
}
