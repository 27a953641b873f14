//! An unbuffered rendezvous channel.
//!
//! Every successful push pairs with exactly one successful pop: the value
//! moves straight from the producer's stack into the consumer, with no
//! buffer in between, and neither side observes success before the exchange
//! has happened.
//!
//! # The slot protocol
//!
//! A producer with a value builds a [`Slot`] *in its own stack frame* and
//! publishes the slot's address through the channel's atomic pointer with a
//! compare-and-swap. This is sound because the producer then suspends, and
//! its stack cannot move or unwind, until the slot is unpublished again, by
//! exactly one of:
//!
//! - a consumer claiming it (CAS to null, move the value out, mark the slot
//!   `TAKEN`, wake the producer);
//! - the producer itself timing out (CAS back to null; the value never
//!   left);
//! - the channel being dropped (CAS to null, mark the slot `ABANDONED`,
//!   wake the producer, which reclaims the value and reports the channel
//!   closed).
//!
//! The slot's state byte is what lets the woken producer tell these apart,
//! and, when its deadline loses the unpublish race by a hair, lets it
//! wait out the claimant before giving its frame back.
//!
//! Wait-list membership and the closed transition are serialized by the
//! channel's spinlock; the slot pointer itself is lock-free.

use core::{
    cell::UnsafeCell,
    fmt,
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering::*},
};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::context::Context;
use crate::error::{RecvError, RecvTimeoutError, SendError, SendTimeoutError};
use crate::list::WaitList;
use crate::scheduler;
use crate::sync::spin::{Backoff, Spinlock};

/// The slot is published and its value has not been moved out.
const PENDING: u8 = 0;
/// A consumer moved the value out.
const TAKEN: u8 = 1;
/// The channel was dropped; the value is still in the slot.
const ABANDONED: u8 = 2;

/// A producer's offer of one value, living in the producer's stack frame
/// for the duration of the push.
struct Slot<T> {
    value: UnsafeCell<ManuallyDrop<T>>,
    /// The producer that owns this slot, woken when the value is consumed.
    ctx: NonNull<Context>,
    state: AtomicU8,
}

/// An unbuffered (rendezvous) channel.
///
/// The channel itself is shared by reference (typically an `Arc`) between
/// any number of producer and consumer fibers, on any schedulers.
///
/// ```
/// use std::sync::Arc;
/// use hypha::sync::UnbufferedChannel;
///
/// hypha::run(|| {
///     let chan = Arc::new(UnbufferedChannel::new());
///     let tx = chan.clone();
///     let producer = hypha::spawn(move || {
///         for n in 1..=3 {
///             tx.push(n).expect("channel closed");
///         }
///         tx.close();
///     });
///     let received: Vec<i32> = chan.iter().collect();
///     assert_eq!(received, vec![1, 2, 3]);
///     producer.join();
/// });
/// ```
pub struct UnbufferedChannel<T> {
    /// Null, or the address of the offering producer's slot.
    slot: AtomicPtr<Slot<T>>,
    closed: AtomicBool,
    waiting: Spinlock<Waiting>,
}

#[derive(Debug)]
struct Waiting {
    producers: WaitList,
    consumers: WaitList,
}

/// A single-pass iterator draining an [`UnbufferedChannel`].
///
/// Each `next` performs a [`pop`](UnbufferedChannel::pop), suspending the
/// calling fiber until a value or closure arrives; the iterator ends once
/// the channel is closed and drained.
#[derive(Debug)]
pub struct Iter<'a, T> {
    chan: &'a UnbufferedChannel<T>,
}

// === impl Slot ===

impl<T> Slot<T> {
    fn new(value: T, ctx: NonNull<Context>) -> Self {
        Self {
            value: UnsafeCell::new(ManuallyDrop::new(value)),
            ctx,
            state: AtomicU8::new(PENDING),
        }
    }

    /// Moves the value back out of the slot.
    ///
    /// # Safety
    ///
    /// The slot must be unpublished and its value still present (state is
    /// not `TAKEN`, and no claimant can still touch it).
    unsafe fn take_back(&mut self) -> T {
        ManuallyDrop::take(self.value.get_mut())
    }

    /// Spins until whoever unpublished this slot has finished with it,
    /// returning the final state.
    ///
    /// The wait is bounded: the claimant is past its CAS and has only a
    /// value move and a store left to do.
    fn wait_released(&self) -> u8 {
        let mut boff = Backoff::new();
        loop {
            match self.state.load(Acquire) {
                PENDING => boff.spin(),
                state => return state,
            }
        }
    }
}

// === impl UnbufferedChannel ===

impl<T> UnbufferedChannel<T> {
    /// Returns a new, open channel.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            closed: AtomicBool::new(false),
            waiting: Spinlock::new(Waiting {
                producers: WaitList::new(),
                consumers: WaitList::new(),
            }),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    /// Closes the channel and wakes every waiting producer and consumer.
    ///
    /// Idempotent. A value already offered by a suspended producer can
    /// still be popped (the channel drains); everything else fails with
    /// the closed error from here on. Safe to call from any thread, fiber
    /// or not.
    pub fn close(&self) {
        let (mut producers, mut consumers) = {
            let mut waiting = self.waiting.lock();
            self.closed.store(true, Release);
            (waiting.producers.take(), waiting.consumers.take())
        };
        trace!("channel closed");
        while let Some(ctx) = producers.pop() {
            scheduler::schedule(ctx);
        }
        while let Some(ctx) = consumers.pop() {
            scheduler::schedule(ctx);
        }
    }

    /// Delivers `value` to a consumer, suspending the calling fiber until
    /// the rendezvous completes.
    ///
    /// # Errors
    ///
    /// Returns the value back if the channel is closed before a consumer
    /// takes it.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn push(&self, value: T) -> Result<(), SendError<T>> {
        let me = scheduler::current_context();
        let mut slot = Slot::new(value, me);
        // raw, not a reborrow: a claimant may read the slot while we still
        // use this pointer
        let own = ptr::addr_of_mut!(slot);
        loop {
            if self.is_closed() {
                return Err(SendError::Closed(unsafe {
                    // Safety: the slot is not published.
                    slot.take_back()
                }));
            }
            // armed before the CAS can expose us through the slot
            unsafe { me.as_ref() }.arm_wake();
            if self.try_push(own) {
                let mut waiting = self.waiting.lock();
                if let Some(consumer) = waiting.consumers.pop() {
                    scheduler::schedule(consumer);
                }
                // suspend until the value is consumed
                scheduler::suspend(waiting);
                return match slot.wait_released() {
                    TAKEN => Ok(()),
                    _ => Err(SendError::Closed(unsafe {
                        // Safety: the channel abandoned the slot without
                        // taking the value, and has finished touching it.
                        slot.take_back()
                    })),
                };
            }
            let mut waiting = self.waiting.lock();
            if self.is_closed() {
                return Err(SendError::Closed(unsafe { slot.take_back() }));
            }
            if self.slot_is_empty() {
                // unpublished while we took the lock; retry the CAS
                continue;
            }
            waiting.producers.push(me);
            // suspend until the slot may be free
            scheduler::suspend(waiting);
        }
    }

    /// As [`push`](Self::push), giving up `timeout` from now.
    pub fn push_wait_for(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.push_wait_until(value, Instant::now() + timeout)
    }

    /// As [`push`](Self::push), giving up at `deadline`.
    ///
    /// On timeout the undelivered value comes back in the error; it is
    /// never both delivered and returned.
    pub fn push_wait_until(
        &self,
        value: T,
        deadline: Instant,
    ) -> Result<(), SendTimeoutError<T>> {
        let me = scheduler::current_context();
        let mut slot = Slot::new(value, me);
        // raw, not a reborrow: a claimant may read the slot while we still
        // use this pointer
        let own = ptr::addr_of_mut!(slot);
        loop {
            if self.is_closed() {
                return Err(SendTimeoutError::Closed(unsafe { slot.take_back() }));
            }
            // armed before the CAS can expose us through the slot
            unsafe { me.as_ref() }.arm_wake();
            if self.try_push(own) {
                let mut waiting = self.waiting.lock();
                if let Some(consumer) = waiting.consumers.pop() {
                    scheduler::schedule(consumer);
                }
                if !scheduler::wait_until(deadline, waiting) {
                    // deadline fired: try to unpublish our own slot
                    if self
                        .slot
                        .compare_exchange(own, ptr::null_mut(), AcqRel, Acquire)
                        .is_ok()
                    {
                        return Err(SendTimeoutError::Timeout(unsafe {
                            // Safety: we unpublished the slot ourselves;
                            // no consumer saw it.
                            slot.take_back()
                        }));
                    }
                    // someone unpublished the slot just before we could;
                    // wait below to learn which way it went
                }
                return match slot.wait_released() {
                    TAKEN => Ok(()),
                    _ => Err(SendTimeoutError::Closed(unsafe { slot.take_back() })),
                };
            }
            let mut waiting = self.waiting.lock();
            if self.is_closed() {
                return Err(SendTimeoutError::Closed(unsafe { slot.take_back() }));
            }
            if self.slot_is_empty() {
                continue;
            }
            waiting.producers.push(me);
            if !scheduler::wait_until(deadline, waiting) {
                // deadline fired while queued; a racing waker may have
                // popped us already, which remove tolerates
                self.waiting.lock().producers.remove(me);
                return Err(SendTimeoutError::Timeout(unsafe { slot.take_back() }));
            }
        }
    }

    /// Receives one value, suspending the calling fiber until a producer
    /// offers one.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Closed`] once the channel is closed and
    /// drained.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn pop(&self) -> Result<T, RecvError> {
        let me = scheduler::current_context();
        loop {
            if let Some(slot) = self.try_pop() {
                return Ok(self.complete_pop(slot));
            }
            let mut waiting = self.waiting.lock();
            if self.is_closed() {
                return Err(RecvError::Closed);
            }
            if !self.slot_is_empty() {
                // a slot appeared while we took the lock; retry the CAS
                continue;
            }
            unsafe { me.as_ref() }.arm_wake();
            waiting.consumers.push(me);
            // suspend until a producer publishes a slot
            scheduler::suspend(waiting);
        }
    }

    /// As [`pop`](Self::pop), giving up `timeout` from now.
    pub fn pop_wait_for(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.pop_wait_until(Instant::now() + timeout)
    }

    /// As [`pop`](Self::pop), giving up at `deadline`.
    pub fn pop_wait_until(&self, deadline: Instant) -> Result<T, RecvTimeoutError> {
        let me = scheduler::current_context();
        loop {
            if let Some(slot) = self.try_pop() {
                return Ok(self.complete_pop(slot));
            }
            let mut waiting = self.waiting.lock();
            if self.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            if !self.slot_is_empty() {
                continue;
            }
            unsafe { me.as_ref() }.arm_wake();
            waiting.consumers.push(me);
            if !scheduler::wait_until(deadline, waiting) {
                self.waiting.lock().consumers.remove(me);
                return Err(RecvTimeoutError::Timeout);
            }
        }
    }

    /// Returns a draining iterator over this channel. See [`Iter`].
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    /// Publishes `own` if no slot is currently published.
    fn try_push(&self, own: *mut Slot<T>) -> bool {
        loop {
            let current = self.slot.load(Acquire);
            if !current.is_null() {
                return false;
            }
            if self
                .slot
                .compare_exchange(current, own, AcqRel, Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Claims the published slot, if any.
    fn try_pop(&self) -> Option<NonNull<Slot<T>>> {
        loop {
            let current = self.slot.load(Acquire);
            let Some(slot) = NonNull::new(current) else {
                return None;
            };
            if self
                .slot
                .compare_exchange(current, ptr::null_mut(), AcqRel, Acquire)
                .is_ok()
            {
                return Some(slot);
            }
        }
    }

    fn slot_is_empty(&self) -> bool {
        self.slot.load(Acquire).is_null()
    }

    /// Finishes a claimed rendezvous: moves the value out, wakes the
    /// producer whose slot this was, and gives one queued producer a shot
    /// at the now-free slot.
    fn complete_pop(&self, slot: NonNull<Slot<T>>) -> T {
        let queued = self.waiting.lock().producers.pop();
        if let Some(ctx) = queued {
            scheduler::schedule(ctx);
        }

        let s = unsafe {
            // Safety: we unpublished the slot, so the producer cannot leave
            // `push`, and its frame cannot go away, before we store the
            // slot state below. Until then the memory is valid.
            slot.as_ref()
        };
        let owner = s.ctx;
        let value = unsafe {
            // Safety: claiming the slot made us the only party moving the
            // value.
            ManuallyDrop::take(&mut *s.value.get())
        };
        // wake the producer first: once the store below releases the slot,
        // a producer woken by its own deadline may return at once, taking
        // its frame (and the context, if the fiber then terminates) with it
        scheduler::schedule(owner);
        s.state.store(TAKEN, Release);
        value
    }
}

unsafe impl<T: Send> Send for UnbufferedChannel<T> {}
unsafe impl<T: Send> Sync for UnbufferedChannel<T> {}

impl<T> Default for UnbufferedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnbufferedChannel<T> {
    fn drop(&mut self) {
        self.close();
        // a producer may still be suspended with a published slot; wake it
        // without delivering the value (it reclaims the value itself and
        // observes the channel closed)
        if let Some(slot) = self.try_pop() {
            let s = unsafe {
                // Safety: as in `complete_pop`.
                slot.as_ref()
            };
            // wake first, release second, for the reason given in
            // `complete_pop`
            scheduler::schedule(s.ctx);
            s.state.store(ABANDONED, Release);
        }
    }
}

impl<T> fmt::Debug for UnbufferedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnbufferedChannel")
            .field("occupied", &!self.slot_is_empty())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<'a, T> IntoIterator for &'a UnbufferedChannel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

// === impl Iter ===

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.pop().ok()
    }
}
