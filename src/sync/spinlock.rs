use core::fmt;

pub type SpinlockGuard<'l, T> = spin::MutexGuard<'l, T>;

/// A named spin lock around a value of type `T`.
pub struct Spinlock<T> {
    name: &'static str,
    inner: spin::Mutex<T>,
}
impl<T> Spinlock<T> {
    /// Initializes a `Spinlock`.
    pub const fn new(name: &'static str, value: T) -> Spinlock<T> {
        Spinlock {
            name,
            inner: spin::Mutex::new(value),
        }
    }
    /// Spin until the lock is free, acquiring afterwards.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.inner.lock()
    }
    /// Whether anyone currently holds the lock.
    ///
    /// Only meaningful as a diagnostic; the answer may be stale
    /// by the time the caller looks at it.
    pub fn holding(&self) -> bool {
        self.inner.is_locked()
    }
}
impl<T: Default> Default for Spinlock<T> {
    fn default() -> Spinlock<T> {
        Spinlock::new("spinlock", T::default())
    }
}
impl<T> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.name)
            .field("locked", &self.holding())
            .finish()
    }
}
