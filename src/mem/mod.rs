pub mod kalloc;

use core::fmt;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

pub const fn pg_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// A physical address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);
impl PhysAddr {
    pub const fn as_usize(self) -> usize {
        self.0
    }
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }
}
impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
