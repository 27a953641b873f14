//! The fiber control block.
//!
//! A [`Context`] is one fiber: its saved execution state (a [`corosensei`]
//! coroutine and the yielder it suspends through), its run-state machine, the
//! intrusive hooks that thread it into the crate's
//! [lists](crate::list), and the bookkeeping for timed waits and joins.
//!
//! # The wake latch
//!
//! A fiber about to wait **arms** its wake latch, and only then lets a
//! pointer to itself escape (onto a wait list, into a channel slot, into the
//! sleep set). Whoever holds such a pointer wakes the fiber by **claiming**
//! the latch, an atomic swap of which exactly one caller wins, and only
//! the winner enqueues the context on its scheduler. This gives every
//! suspension exactly one wake, even when
//!
//! - the waker runs on another thread *before* the fiber has finished
//!   switching out (the enqueued context is not resumed until its own
//!   thread's dispatcher regains control), or
//! - a deadline and an explicit wake race (the loser's claim fails and it
//!   walks away).
//!
//! # Field ownership
//!
//! `Context` is shared across threads (`Send + Sync` below) but almost none
//! of it is concurrently accessed. The protocol, field by field:
//!
//! - `wake` is the latch above: the only field arbitrary threads write.
//! - `state` is atomic for cheap inspection, but transitions are made only
//!   by the owning thread; it is diagnostic, not load-bearing.
//! - `next` belongs to whichever *wait list* the context currently sits
//!   in, `run_next` to whichever *run queue* (local ready or remote);
//!   each is only read or written while holding the owning queue's lock
//!   (or from the owning thread, for the scheduler-private ready queue).
//!   The hooks are separate fields because both memberships can hold at
//!   once: a timed waiter is promoted to the ready queue by its deadline
//!   while still linked in the wait list it will unlink itself from after
//!   resuming.
//! - `coro`, `yielder`, `timed_out`, `deadline` and `in_sleep` belong to the
//!   owning scheduler's thread. The fiber itself and its dispatcher run on
//!   that one thread, never concurrently.
//! - `join` carries its own spinlock.

use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicU8, Ordering::*},
};
use std::{sync::Arc, time::Instant};

use corosensei::{Coroutine, Yielder};

use crate::list::WaitList;
use crate::scheduler::Shared;
use crate::sync::spin::Spinlock;

/// The saved execution state of a fiber. Fibers neither take input on resume
/// nor produce values on yield; all hand-off happens through memory.
pub(crate) type Coro = Coroutine<(), (), ()>;

/// Run state of a fiber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    /// In a ready queue, waiting for the dispatcher to resume it.
    Ready = 0,
    /// Currently executing (at most one per scheduler).
    Running = 1,
    /// Suspended on some primitive, waiting to be claimed by a waker.
    Waiting = 2,
    /// Ran to completion; will never be resumed again.
    Terminated = 3,
}

/// Wake latch: armed by the fiber before it becomes findable.
const WAKE_ARMED: u8 = 0;
/// Wake latch: some waker (or the timer) owns this suspension's one wake.
const WAKE_CLAIMED: u8 = 1;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A fiber control block. See the module docs for the field ownership
/// protocol.
pub(crate) struct Context {
    /// Fiber id, for traces and `Debug` output.
    pub(crate) id: u64,
    /// Optional name from the spawn [`Builder`](crate::fiber::Builder).
    pub(crate) name: Option<String>,
    /// The wake latch; see the module docs.
    wake: AtomicU8,
    state: AtomicU8,
    /// Intrusive hook for [`WaitList`]s (channel sides, condition
    /// variables, joiners).
    pub(crate) next: UnsafeCell<Option<NonNull<Context>>>,
    /// Intrusive hook for [`RunList`](crate::list::RunList)s (a
    /// scheduler's ready and remote queues). Never shared with `next`; see
    /// the module docs.
    pub(crate) run_next: UnsafeCell<Option<NonNull<Context>>>,
    /// Handle to the owning scheduler's cross-thread half, used to route
    /// wakeups from foreign threads.
    pub(crate) sched: Arc<Shared>,
    /// The coroutine, parked here between resumptions. `None` while the
    /// fiber is executing (the dispatcher holds it) and after termination.
    pub(crate) coro: UnsafeCell<Option<Coro>>,
    /// Pointer to the yielder the running fiber suspends through. Set once
    /// when the fiber first runs.
    pub(crate) yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,
    /// Whether the most recent wake was the deadline firing rather than an
    /// explicit schedule. Written by the dispatcher, read by the fiber after
    /// it resumes.
    pub(crate) timed_out: Cell<bool>,
    /// Deadline key while the context is in the sleep set.
    pub(crate) deadline: Cell<Option<Instant>>,
    /// Whether the context is currently in the sleep set.
    pub(crate) in_sleep: Cell<bool>,
    /// Completion flag plus the fibers waiting to join this one.
    pub(crate) join: Spinlock<JoinState>,
}

/// State behind [`Context::join`].
#[derive(Debug)]
pub(crate) struct JoinState {
    pub(crate) completed: bool,
    pub(crate) waiters: WaitList,
}

// === impl Context ===

impl Context {
    pub(crate) fn new(sched: Arc<Shared>, name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Relaxed),
            name,
            // spawn enqueues the fiber directly; nothing may claim it
            wake: AtomicU8::new(WAKE_CLAIMED),
            state: AtomicU8::new(State::Ready as u8),
            next: UnsafeCell::new(None),
            run_next: UnsafeCell::new(None),
            sched,
            coro: UnsafeCell::new(None),
            yielder: Cell::new(None),
            timed_out: Cell::new(false),
            deadline: Cell::new(None),
            in_sleep: Cell::new(false),
            join: Spinlock::new(JoinState {
                completed: false,
                waiters: WaitList::new(),
            }),
        })
    }

    pub(crate) fn state(&self) -> State {
        match self.state.load(Acquire) {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Waiting,
            _ => State::Terminated,
        }
    }

    /// Arms the wake latch for an imminent wait.
    ///
    /// Must be called once per wait, *before* any pointer to this context
    /// escapes (wait-list push, slot publication, sleep-set insertion).
    /// The arm is what a subsequent [`claim_wake`](Self::claim_wake)
    /// consumes, and an arm issued after a claim would let the suspension
    /// be woken twice.
    pub(crate) fn arm_wake(&self) {
        self.wake.store(WAKE_ARMED, Release);
    }

    /// Claims the armed wake.
    ///
    /// Returns `true` for exactly one caller per [`arm_wake`]; the winner
    /// is responsible for enqueueing the context on its scheduler, every
    /// loser must walk away.
    ///
    /// [`arm_wake`]: Self::arm_wake
    pub(crate) fn claim_wake(&self) -> bool {
        self.wake.swap(WAKE_CLAIMED, AcqRel) == WAKE_ARMED
    }

    /// Diagnostic state transition; see the module docs.
    pub(crate) fn set_waiting(&self) {
        self.state.store(State::Waiting as u8, Release);
    }

    /// `Running → Ready` for the yield path; the fiber re-enqueues itself.
    pub(crate) fn set_ready_direct(&self) {
        self.state.store(State::Ready as u8, Release);
    }

    pub(crate) fn set_running(&self) {
        self.state.store(State::Running as u8, Release);
    }

    pub(crate) fn set_terminated(&self) {
        self.state.store(State::Terminated as u8, Release);
    }

    /// A `NonNull` to this context, the form the queues traffic in.
    pub(crate) fn as_ptr(&self) -> NonNull<Context> {
        NonNull::from(self)
    }

    #[cfg(test)]
    pub(crate) fn stub() -> Arc<Self> {
        Self::new(Arc::new(Shared::new(std::thread::current())), None)
    }
}

// Safety: see the module docs. The atomic `wake` latch (and the diagnostic
// `state`) are the only fields accessed without external synchronization;
// everything else is either owned by the scheduler thread or guarded by the
// lock of the queue the context sits in.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Context");
        dbg.field("id", &self.id);
        if let Some(name) = &self.name {
            dbg.field("name", name);
        }
        dbg.field("state", &self.state()).finish_non_exhaustive()
    }
}
