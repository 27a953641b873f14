//! A condition variable for fibers.
//!
//! A [`Condvar`] stores no predicate, only waiters: callers loop on their
//! own predicate under a [`Mutex`], exactly as with `std::sync::Condvar`.
//! Spurious wakeups are permitted. Notification order respects the FIFO
//! order in which waiters enqueued, and a waiter that timed out and
//! unlinked itself can no longer consume a notification.

use std::time::{Duration, Instant};

use crate::list::WaitList;
use crate::scheduler;
use crate::sync::mutex::MutexGuard;
use crate::sync::spin::Spinlock;

/// A wait-queue-backed condition variable.
#[derive(Debug)]
pub struct Condvar {
    waiters: Spinlock<WaitList>,
}

/// Whether a timed wait returned because its deadline passed.
///
/// Returned by [`Condvar::wait_until`] and [`Condvar::wait_for`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

// === impl Condvar ===

impl Condvar {
    /// Returns a new condition variable with no waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(WaitList::new()),
        }
    }

    /// Atomically releases `guard` and suspends the calling fiber until it
    /// is notified, then re-acquires the mutex.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let me = scheduler::current_context();
        let mutex = guard.mutex();

        let mut waiters = self.waiters.lock();
        unsafe {
            // Safety: `me` is the running fiber's context.
            me.as_ref()
        }
        .arm_wake();
        waiters.push(me);
        // the predicate mutex is released only after we are enqueued, so a
        // notify between unlock and suspend still finds us
        drop(guard);
        scheduler::suspend(waiters);

        mutex.lock()
    }

    /// As [`wait`](Self::wait), but gives up at `deadline`.
    ///
    /// The mutex is re-acquired before returning in either case.
    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let me = scheduler::current_context();
        let mutex = guard.mutex();

        let mut waiters = self.waiters.lock();
        unsafe {
            // Safety: `me` is the running fiber's context.
            me.as_ref()
        }
        .arm_wake();
        waiters.push(me);
        drop(guard);
        let notified = scheduler::wait_until(deadline, waiters);
        if !notified {
            // the deadline fired; take ourselves back out of the queue
            // (a racing notify may have popped us already, which is fine)
            self.waiters.lock().remove(me);
        }

        (mutex.lock(), WaitTimeoutResult(!notified))
    }

    /// As [`wait_until`](Self::wait_until) with a deadline of now +
    /// `timeout`.
    pub fn wait_for<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_until(guard, Instant::now() + timeout)
    }

    /// Wakes the waiter at the head of the queue, if any.
    ///
    /// Safe to call from any thread, fiber or not.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop();
        if let Some(ctx) = waiter {
            scheduler::schedule(ctx);
        }
    }

    /// Wakes every current waiter, in FIFO order.
    ///
    /// Safe to call from any thread, fiber or not. Waiters that enqueue
    /// after the queue is drained are unaffected.
    pub fn notify_all(&self) {
        let mut drained = self.waiters.lock().take();
        while let Some(ctx) = drained.pop() {
            scheduler::schedule(ctx);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the wait list is only touched under the spinlock, and waking a
// popped context goes through `scheduler::schedule`, which is safe from any
// thread.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

// === impl WaitTimeoutResult ===

impl WaitTimeoutResult {
    /// `true` if the wait ended because the deadline passed.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.0
    }
}
