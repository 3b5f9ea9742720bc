/// Max num of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;
/// Size of disk block cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// Number of hash buckets the block cache is split into.
/// Prime, so consecutive block numbers spread evenly.
pub const NBUCKET: usize = 13;
/// Block size.
pub const BSIZE: usize = 1024;
/// Device number of file system root disk
pub const ROOTDEV: u32 = 1;

/// Physical memory the allocator manages by default starts here.
pub const KERNBASE: usize = 0x8000_0000;
/// End of RAM handed to the page allocator by default.
pub const PHYSTOP: usize = KERNBASE + 4 * 1024 * 1024;
