//! Long-term locks for threads.
//!
//! A waiter is descheduled until the holder releases the lock,
//! so the holder may block on I/O without burning other CPUs.

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut, Drop},
};
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

pub struct Sleeplock<T> {
    name: &'static str,
    /// Thread holding the lock, if any.
    holder: Mutex<Option<ThreadId>>,
    wakeup: Condvar,
    inner: UnsafeCell<T>,
}
unsafe impl<T: Send> Sync for Sleeplock<T> {}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, value: T) -> Sleeplock<T> {
        Sleeplock {
            name,
            holder: Mutex::new(None),
            wakeup: Condvar::new(),
            inner: UnsafeCell::new(value),
        }
    }
    fn holder(&self) -> MutexGuard<'_, Option<ThreadId>> {
        // Poisoning is ignored: the slot is always written whole.
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Sleep until the lock is free, acquiring afterwards.
    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let me = thread::current().id();
        let mut holder = self.holder();
        if *holder == Some(me) {
            panic!("acquiresleep: {} already held", self.name);
        }
        while holder.is_some() {
            holder = self
                .wakeup
                .wait(holder)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *holder = Some(me);
        SleeplockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }
    /// Whether the calling thread holds this lock.
    pub fn holding(&self) -> bool {
        *self.holder() == Some(thread::current().id())
    }
    fn unlock(&self) {
        *self.holder() = None;
        self.wakeup.notify_one();
    }
}
impl<T: Default> Default for Sleeplock<T> {
    fn default() -> Sleeplock<T> {
        Sleeplock::new("sleeplock", T::default())
    }
}
impl<T> fmt::Debug for Sleeplock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleeplock")
            .field("name", &self.name)
            .field("holder", &*self.holder())
            .finish()
    }
}

/// Proof that the current thread holds a [`Sleeplock`].
///
/// The guard is `!Send`: the thread that acquired the lock
/// must be the one to release it.
pub struct SleeplockGuard<'l, T> {
    lock: &'l Sleeplock<T>,
    _not_send: PhantomData<*const ()>,
}
impl<'l, T> Deref for SleeplockGuard<'l, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.inner.get() }
    }
}
impl<'l, T> DerefMut for SleeplockGuard<'l, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.inner.get() }
    }
}
impl<'l, T> Drop for SleeplockGuard<'l, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[test]
    fn holding_tracks_the_current_thread() {
        let lock = Arc::new(Sleeplock::new("test", 0u32));
        let guard = lock.lock();
        assert!(lock.holding());

        let other = lock.clone();
        let seen = thread::spawn(move || other.holding()).join().unwrap();
        assert!(!seen);

        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    fn waiter_sleeps_until_release() {
        let lock = Arc::new(Sleeplock::new("test", Vec::new()));
        let acquired = Arc::new(AtomicBool::new(false));

        let mut guard = lock.lock();
        guard.push(1);

        let waiter = {
            let lock = lock.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let mut guard = lock.lock();
                acquired.store(true, Ordering::SeqCst);
                guard.push(2);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);

        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(*lock.lock(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "acquiresleep: test already held")]
    fn reacquire_by_holder_panics() {
        let lock = Sleeplock::new("test", ());
        let _guard = lock.lock();
        let _again = lock.lock();
    }
}
