pub mod bio;
pub mod buf;

pub use bio::{BcacheStats, BufferCache};
pub use buf::{Buf, BufData, BufId};
