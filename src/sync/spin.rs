//! Spinlocks for short, non-suspending critical sections.
//!
//! Every wait list in this crate is guarded by a [`Spinlock`]: contention is
//! brief (a handful of pointer writes), so busy-waiting with an exponential
//! [`Backoff`] beats parking the thread. The one rule, stated in the
//! invariants of every caller, is that a spinlock is **never held across a
//! suspension point**: the scheduler's suspend primitive takes the guard
//! by value and releases it before switching stacks.

use core::{
    cell::UnsafeCell,
    fmt, hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering::*},
};

/// A busy-wait mutual exclusion lock protecting a `T`.
///
/// The data can only be reached through the RAII [`SpinGuard`] returned by
/// [`lock`](Self::lock) and [`try_lock`](Self::try_lock). This lock is not
/// fair; waiters spin with exponential backoff and acquisition order is
/// unspecified.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII guard releasing the [`Spinlock`] on drop.
///
/// The protected data is reached through this guard's [`Deref`] and
/// [`DerefMut`] implementations.
#[must_use = "holding a SpinGuard is what holds the lock"]
pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

/// An exponential backoff for spin loops.
///
/// Each call to [`spin`](Self::spin) issues `2^exp` spin-loop hints, where
/// `exp` starts at zero and grows by one per call up to a maximum.
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Spinlock ===

impl<T> Spinlock<T> {
    /// Returns a new, unlocked `Spinlock` protecting `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok()
            .then_some(SpinGuard { lock: self })
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut boff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_err()
        {
            while self.locked.load(Relaxed) {
                boff.spin();
            }
        }
        SpinGuard { lock: self }
    }
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T: fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Spinlock");
        match self.try_lock() {
            Some(guard) => dbg.field("data", &*guard).finish(),
            None => dbg.field("data", &format_args!("<locked>")).finish(),
        }
    }
}

// === impl SpinGuard ===

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe {
            // Safety: we hold the lock.
            &*self.lock.data.get()
        }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: we hold the lock.
            &mut *self.lock.data.get()
        }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

// === impl Backoff ===

impl Backoff {
    const DEFAULT_MAX_EXPONENT: u8 = 8;

    /// Returns a new backoff with the default maximum exponent.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Backs off in a spin loop, doubling the number of spin-loop hints
    /// issued each time (up to the maximum).
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1_u32 << self.exp) {
            hint::spin_loop();
        }
        if self.exp < self.max {
            self.exp += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn multithreaded() {
        let lock = Arc::new(Spinlock::new(String::new()));
        let lock2 = lock.clone();

        let t1 = thread::spawn(move || {
            for _ in 0..100 {
                lock2.lock().push('a');
            }
        });
        for _ in 0..100 {
            lock.lock().push('b');
        }
        t1.join().unwrap();

        assert_eq!(lock.lock().len(), 200);
    }

    #[test]
    fn try_lock() {
        let lock = Spinlock::new(42);

        let a = lock.try_lock();
        assert_eq!(a.as_deref(), Some(&42));

        // a second acquisition fails while the guard is live
        assert!(lock.try_lock().is_none());

        drop(a);
        assert!(lock.try_lock().is_some());
    }
}
