//! Lock primitives.
//!
//! Two kinds of lock, never interchangeable:
//! - [`Spinlock`] busy-waits and is only held across short,
//!   bounded critical sections that never do I/O.
//! - [`Sleeplock`] suspends the calling thread until the holder
//!   releases it, so it may be held across a disk request.

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{Spinlock, SpinlockGuard};
