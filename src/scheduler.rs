//! The per-thread run loop.
//!
//! A [`Scheduler`] multiplexes any number of fibers onto the one OS thread
//! that created it. The dispatcher runs on that thread's own stack: it pops
//! the next ready context, resumes its coroutine, and regains control when
//! the fiber suspends, yields, or terminates. Fairness is FIFO.
//!
//! Three queues drive the loop:
//!
//! - the **ready queue**, an intrusive FIFO private to the owning thread;
//! - the **sleep set**, ordered by deadline, holding fibers in timed waits;
//! - the **remote queue**, a spinlock-guarded FIFO that other threads feed
//!   through [`schedule`], paired with an `unpark` of the owning thread. The
//!   dispatcher drains it into the ready queue at the top of every
//!   iteration; the spinlock's release/acquire pair is the
//!   synchronizes-with edge for cross-scheduler wakeups.
//!
//! The ready and remote queues are [`RunList`]s, threaded through their own
//! hook in the context rather than the wait-list link: a timed waiter is
//! promoted to the ready queue while still linked in the wait list it only
//! unlinks itself from after resuming.
//!
//! A fiber in a timed wait can be woken by its deadline or by an explicit
//! [`schedule`]; whichever claims the context's wake latch (see
//! [`crate::context`]) is the one wake that happens, and the deadline path
//! records itself in the context's `timed_out` flag before enqueueing.

use core::{
    cell::{Cell, RefCell},
    ptr::{self, NonNull},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    thread::{self, Thread},
    time::Instant,
};

use corosensei::CoroutineResult;
use tracing::{debug, trace, trace_span};

use crate::context::{Context, Coro, State};
use crate::list::RunList;
use crate::sync::spin::{SpinGuard, Spinlock};

std::thread_local! {
    static CURRENT: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
}

/// A per-thread cooperative scheduler.
///
/// A `Scheduler` is driven by [`run`](Scheduler::run) on the thread that
/// created it (the type is not `Send`, so it cannot leave that thread). All
/// fibers spawned while it runs belong to it and are resumed only by it;
/// other threads interact with its fibers exclusively through [`schedule`]'s
/// remote path.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
    /// Runnable fibers, FIFO.
    ready: RefCell<RunList>,
    /// Fibers in timed waits, keyed by deadline (context address breaks
    /// ties).
    sleep: RefCell<BTreeMap<(Instant, usize), NonNull<Context>>>,
    /// Every live fiber, keyed by context address. This registry is what
    /// keeps a context allocated while non-owning pointers to it sit in
    /// queues; an entry is removed only at termination, when the context is
    /// in no queue.
    fibers: RefCell<HashMap<usize, Arc<Context>>>,
    /// The running fiber, while the dispatcher is inside `resume`.
    current: Cell<Option<NonNull<Context>>>,
}

/// The cross-thread half of a scheduler: the remote ready queue and the
/// handle used to unpark the owning thread. Contexts hold an `Arc` of this
/// so foreign threads can wake them without touching scheduler-private
/// state.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) remote: Spinlock<RunList>,
    thread: Thread,
}

// === impl Shared ===

impl Shared {
    pub(crate) fn new(thread: Thread) -> Self {
        Self {
            remote: Spinlock::new(RunList::new()),
            thread,
        }
    }
}

// === impl Scheduler ===

impl Scheduler {
    /// Returns a new scheduler owned by the current thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(thread::current())),
            ready: RefCell::new(RunList::new()),
            sleep: RefCell::new(BTreeMap::new()),
            fibers: RefCell::new(HashMap::new()),
            current: Cell::new(None),
        }
    }

    /// Runs `f` as the first fiber and dispatches until every fiber on this
    /// scheduler has terminated, then returns `f`'s value.
    ///
    /// # Panics
    ///
    /// Panics if a scheduler is already running on this thread, or if a
    /// stack cannot be allocated for the first fiber. A panic inside any
    /// fiber propagates out of `run`.
    pub fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let _enter = self.enter();
        debug!("scheduler running");
        let main = crate::fiber::Builder::new()
            .name("main")
            .spawn(f)
            .expect("failed to allocate a stack for the main fiber");
        self.dispatch();
        debug!("all fibers terminated");
        main.into_result()
            .expect("the main fiber did not run to completion")
    }

    /// Marks this scheduler as the thread's current one for the duration of
    /// the returned guard.
    fn enter(&self) -> impl Drop {
        struct Enter;
        impl Drop for Enter {
            fn drop(&mut self) {
                CURRENT.with(|cur| cur.set(ptr::null()));
            }
        }
        CURRENT.with(|cur| {
            assert!(
                cur.get().is_null(),
                "hypha: a scheduler is already running on this thread"
            );
            cur.set(self as *const Self);
        });
        Enter
    }

    fn dispatch(&self) {
        loop {
            self.drain_remote();
            self.wake_sleepers();
            let next = self.ready.borrow_mut().pop();
            match next {
                Some(ctx) => self.resume(ctx),
                None => {
                    if self.fibers.borrow().is_empty() {
                        break;
                    }
                    self.park();
                }
            }
        }
    }

    /// Moves remotely scheduled contexts into the local ready queue.
    fn drain_remote(&self) {
        let mut remote = {
            let mut queue = self.shared.remote.lock();
            queue.take()
        };
        let mut ready = self.ready.borrow_mut();
        while let Some(ctx) = remote.pop() {
            ready.push(ctx);
        }
    }

    /// Moves every sleeper whose deadline has passed to the ready queue,
    /// unless an explicit wake claimed it first.
    fn wake_sleepers(&self) {
        let now = Instant::now();
        loop {
            let key = match self.sleep.borrow().keys().next() {
                Some(&(deadline, addr)) if deadline <= now => (deadline, addr),
                _ => break,
            };
            let Some(ctx) = self.sleep.borrow_mut().remove(&key) else {
                break;
            };
            let c = unsafe {
                // Safety: contexts in the sleep set are live fibers of this
                // scheduler; the registry keeps them allocated.
                ctx.as_ref()
            };
            c.in_sleep.set(false);
            c.deadline.set(None);
            if c.claim_wake() {
                trace!(fiber.id = c.id, "deadline fired");
                c.timed_out.set(true);
                self.ready.borrow_mut().push(ctx);
            }
            // otherwise an explicit wake won the claim; the context is
            // already on its way through a ready queue
        }
    }

    /// Resumes one fiber and handles whatever it did with the control it
    /// got.
    fn resume(&self, ctx: NonNull<Context>) {
        let c = unsafe {
            // Safety: ready contexts are live fibers of this scheduler.
            ctx.as_ref()
        };
        debug_assert_ne!(c.state(), State::Terminated);

        // A context can reach the ready queue while still in the sleep set
        // (an explicit wake beat its deadline). Retire the deadline first.
        if c.in_sleep.get() {
            if let Some(deadline) = c.deadline.get() {
                self.sleep
                    .borrow_mut()
                    .remove(&(deadline, ctx.as_ptr() as usize));
            }
            c.in_sleep.set(false);
            c.deadline.set(None);
        }

        c.set_running();
        self.current.set(Some(ctx));
        let mut coro = unsafe {
            // Safety: `coro` is only touched from the owning thread, and the
            // fiber is not running (we are about to resume it).
            (*c.coro.get()).take()
        }
        .expect("a ready fiber must have a parked coroutine");

        let span = trace_span!("fiber", id = c.id);
        let result = {
            let _enter = span.enter();
            coro.resume(())
        };
        self.current.set(None);

        match result {
            CoroutineResult::Yield(()) => unsafe {
                // Safety: as above; the fiber has switched out.
                *c.coro.get() = Some(coro);
            },
            CoroutineResult::Return(()) => self.retire(ctx, coro),
        }
    }

    /// Completes a terminated fiber: wakes its joiners and releases the
    /// registry's reference.
    fn retire(&self, ctx: NonNull<Context>, coro: Coro) {
        let c = unsafe { ctx.as_ref() };
        c.set_terminated();
        trace!(fiber.id = c.id, "fiber terminated");
        drop(coro);

        let mut waiters = {
            let mut join = c.join.lock();
            join.completed = true;
            join.waiters.take()
        };
        while let Some(waiter) = waiters.pop() {
            schedule(waiter);
        }

        let key = ctx.as_ptr() as usize;
        // Dropping the registry entry may free the context; `c` must not be
        // touched past this line.
        self.fibers.borrow_mut().remove(&key);
    }

    /// Blocks the OS thread until the next deadline or an unpark from a
    /// remote [`schedule`].
    fn park(&self) {
        if !self.shared.remote.lock().is_empty() {
            return;
        }
        let next_deadline = self.sleep.borrow().keys().next().map(|&(t, _)| t);
        match next_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    trace!(timeout = ?(deadline - now), "park");
                    thread::park_timeout(deadline - now);
                }
            }
            None => {
                trace!("park");
                thread::park();
            }
        }
    }

    /// Adds a freshly spawned fiber to the registry and the ready queue.
    pub(crate) fn register(&self, ctx: Arc<Context>) {
        let ptr = ctx.as_ptr();
        trace!(fiber.id = ctx.id, fiber.name = ?ctx.name, "spawn");
        self.fibers.borrow_mut().insert(ptr.as_ptr() as usize, ctx);
        self.ready.borrow_mut().push(ptr);
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` on a fresh [`Scheduler`] owned by the current thread.
///
/// Equivalent to `Scheduler::new().run(f)`; see [`Scheduler::run`].
pub fn run<F, T>(f: F) -> T
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Scheduler::new().run(f)
}

/// Calls `f` with the thread's current scheduler.
///
/// # Panics
///
/// Panics if no scheduler is running on this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    CURRENT.with(|cur| {
        let ptr = cur.get();
        assert!(
            !ptr.is_null(),
            "hypha: this operation requires a running scheduler (wrap the call in `hypha::run`)"
        );
        f(unsafe {
            // Safety: the pointer is installed for the duration of
            // `Scheduler::run`, whose frame outlives every fiber dispatch.
            &*ptr
        })
    })
}

/// The context of the running fiber.
///
/// # Panics
///
/// Panics when called outside a fiber (including from the dispatcher
/// itself).
pub(crate) fn current_context() -> NonNull<Context> {
    with_current(|sched| sched.current.get())
        .expect("hypha: this operation must be called from a fiber")
}

/// Makes `ctx` ready, wherever it lives.
///
/// This is the one entry point for waking a suspended fiber, callable from
/// any thread (including threads with no scheduler at all). It is
/// idempotent per suspension: only the caller that claims the context's
/// wake latch enqueues it, and the claim works even when the target has
/// not yet finished switching out (its dispatcher cannot resume it before
/// the switch completes). A context owned by the calling thread's
/// scheduler goes straight onto the local ready queue; anything else goes
/// through the owner's remote queue followed by an unpark.
pub(crate) fn schedule(ctx: NonNull<Context>) {
    let c = unsafe {
        // Safety: callers only schedule contexts they found in a wait queue
        // or hold a registry/`JoinHandle` reference to, so the context is
        // live.
        ctx.as_ref()
    };
    if !c.claim_wake() {
        return;
    }
    let local = CURRENT.with(|cur| {
        let ptr = cur.get();
        !ptr.is_null() && Arc::ptr_eq(&unsafe { &*ptr }.shared, &c.sched)
    });
    if local {
        with_current(|sched| sched.ready.borrow_mut().push(ctx));
    } else {
        trace!(fiber.id = c.id, "schedule (remote)");
        c.sched.remote.lock().push(ctx);
        c.sched.thread.unpark();
    }
}

/// Suspends the running fiber, releasing `guard` on the way out.
///
/// The caller must have armed the context's wake latch before letting a
/// pointer to it escape (typically: arm, push onto a wait list, then call
/// this with the list's lock still held). Returns once a waker has claimed
/// the latch via [`schedule`] and the dispatcher has resumed the fiber.
pub(crate) fn suspend<T>(guard: SpinGuard<'_, T>) {
    let ctx = current_context();
    let c = unsafe { ctx.as_ref() };
    c.set_waiting();
    drop(guard);
    switch_out(c);
}

/// As [`suspend`], but also arms a deadline.
///
/// Returns `true` if the wake was an explicit [`schedule`], `false` if the
/// deadline fired. On `false` the caller is responsible for unlinking
/// itself from whatever wait list it joined before suspending. As with
/// [`suspend`], the wake latch must already be armed; the deadline is
/// just one more contender for it.
pub(crate) fn wait_until<T>(deadline: Instant, guard: SpinGuard<'_, T>) -> bool {
    let ctx = current_context();
    let c = unsafe { ctx.as_ref() };
    with_current(|sched| {
        c.timed_out.set(false);
        c.deadline.set(Some(deadline));
        c.in_sleep.set(true);
        sched
            .sleep
            .borrow_mut()
            .insert((deadline, ctx.as_ptr() as usize), ctx);
    });
    c.set_waiting();
    drop(guard);
    switch_out(c);
    !c.timed_out.get()
}

/// Suspends the running fiber until `deadline`. Nothing else holds a
/// pointer to the context, so only the deadline can wake it.
pub(crate) fn sleep_until(deadline: Instant) {
    let ctx = current_context();
    let c = unsafe { ctx.as_ref() };
    c.arm_wake();
    with_current(|sched| {
        c.timed_out.set(false);
        c.deadline.set(Some(deadline));
        c.in_sleep.set(true);
        sched
            .sleep
            .borrow_mut()
            .insert((deadline, ctx.as_ptr() as usize), ctx);
    });
    c.set_waiting();
    switch_out(c);
}

/// Moves the running fiber to the back of the ready queue and switches to
/// the dispatcher, guaranteeing other ready fibers progress.
pub(crate) fn yield_now() {
    let ctx = current_context();
    let c = unsafe { ctx.as_ref() };
    c.set_ready_direct();
    with_current(|sched| sched.ready.borrow_mut().push(ctx));
    switch_out(c);
}

/// Switches from the running fiber back into the dispatcher's `resume`
/// call.
fn switch_out(c: &Context) {
    let yielder = c
        .yielder
        .get()
        .expect("a suspending fiber must have stored its yielder");
    unsafe {
        // Safety: the yielder points into the trampoline frame of this
        // fiber's own coroutine, which is alive for as long as the fiber
        // can run.
        yielder.as_ref().suspend(());
    }
}
