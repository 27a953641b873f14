//! A mutual exclusion lock that suspends the calling fiber.
//!
//! Unlike a [`Spinlock`](crate::sync::spin::Spinlock), a [`Mutex`] may be
//! held across suspension points: a fiber that finds it contended parks
//! itself on the mutex's wait list and the unlocking fiber wakes the head
//! waiter. Fibers on different schedulers may share one `Mutex`.

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::context::Context;
use crate::list::WaitList;
use crate::scheduler;
use crate::sync::spin::Spinlock;

/// A fiber-aware mutual exclusion lock protecting a `T`.
pub struct Mutex<T> {
    state: Spinlock<MutexState>,
    data: UnsafeCell<T>,
}

struct MutexState {
    /// The context currently holding the lock.
    owner: Option<NonNull<Context>>,
    waiters: WaitList,
}

/// An RAII guard unlocking the [`Mutex`] on drop.
///
/// The protected data is reached through this guard's [`Deref`] and
/// [`DerefMut`] implementations.
#[must_use = "holding a MutexGuard is what holds the lock"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    /// Ownership is tied to the locking fiber, which cannot change threads;
    /// the guard must not either.
    _not_send: PhantomData<*mut ()>,
}

// === impl Mutex ===

impl<T> Mutex<T> {
    /// Returns a new, unlocked `Mutex` protecting `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            state: Spinlock::new(MutexState {
                owner: None,
                waiters: WaitList::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the mutex, suspending the calling fiber while it is held
    /// elsewhere.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber, or if the calling fiber already
    /// owns the mutex (a self-deadlock).
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = scheduler::current_context();
        loop {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(me);
                    return MutexGuard {
                        mutex: self,
                        _not_send: PhantomData,
                    };
                }
                Some(owner) if owner == me => {
                    panic!("hypha: fiber attempted to lock a mutex it already owns")
                }
                Some(_) => {
                    unsafe {
                        // Safety: `me` is the running fiber's context.
                        me.as_ref()
                    }
                    .arm_wake();
                    state.waiters.push(me);
                    scheduler::suspend(state);
                    // woken by an unlock; race for the lock again
                }
            }
        }
    }

    /// Attempts to acquire the mutex without suspending.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = scheduler::current_context();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                Some(MutexGuard {
                    mutex: self,
                    _not_send: PhantomData,
                })
            }
            Some(_) => None,
        }
    }

    /// Returns a mutable reference to the data; no locking is needed with
    /// exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        let waiter = {
            let mut state = self.state.lock();
            state.owner = None;
            state.waiters.pop()
        };
        if let Some(ctx) = waiter {
            scheduler::schedule(ctx);
        }
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Mutex");
        let state = self.state.lock();
        match state.owner {
            None => dbg.field("data", unsafe {
                // Safety: the lock is not owned, and we hold the state
                // spinlock, so no fiber can acquire it while we format.
                &*self.data.get()
            }),
            Some(_) => dbg.field("data", &format_args!("<locked>")),
        }
        .finish()
    }
}

// === impl MutexGuard ===

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe {
            // Safety: the calling fiber owns the lock.
            &*self.mutex.data.get()
        }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: the calling fiber owns the lock.
            &mut *self.mutex.data.get()
        }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard locks, for re-acquisition after a condition
    /// wait.
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
