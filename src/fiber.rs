//! Spawning fibers and operating on the current one.
//!
//! [`spawn`] starts a new fiber on the current thread's scheduler and hands
//! back a [`JoinHandle`]; [`Builder`] is the configurable form. The
//! free functions [`yield_now`], [`sleep_for`] and [`sleep_until`] act on
//! whichever fiber calls them.
//!
//! Fibers never migrate between threads, so unlike `std::thread::spawn` the
//! closure does not need to be `Send`, only `'static`.

use core::ptr::NonNull;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corosensei::stack::DefaultStack;
use corosensei::Coroutine;

use crate::context::Context;
use crate::scheduler;
use crate::sync::spin::Spinlock;

/// Default fiber stack size: 1 MiB of (lazily committed) address space.
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Configuration for a new fiber.
///
/// ```
/// hypha::run(|| {
///     let handle = hypha::Builder::new()
///         .name("worker")
///         .stack_size(256 * 1024)
///         .spawn(|| 2 + 2)
///         .expect("failed to allocate a fiber stack");
///     assert_eq!(handle.join(), 4);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
    name: Option<String>,
}

/// An owned permission to join a fiber.
///
/// Dropping the handle detaches the fiber; it keeps running to completion on
/// its scheduler.
#[derive(Debug)]
pub struct JoinHandle<T> {
    ctx: Arc<Context>,
    result: Arc<Spinlock<Option<T>>>,
}

// === impl Builder ===

impl Builder {
    /// Returns a builder with the default stack size and no name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }

    /// Sets the size of the fiber's stack in bytes.
    #[must_use]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Names the fiber. The name shows up in traces and `Debug` output.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawns a fiber running `f` on the current thread's scheduler.
    ///
    /// The fiber starts in the ready queue and first runs when the spawner
    /// next suspends or yields.
    ///
    /// # Errors
    ///
    /// Returns an error if a stack of the requested size cannot be
    /// allocated.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is running on this thread.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let stack = DefaultStack::new(self.stack_size)?;
        Ok(scheduler::with_current(|sched| {
            let ctx = Context::new(sched.shared(), self.name);
            let result = Arc::new(Spinlock::new(None));

            let ctx_ptr = ctx.as_ptr();
            let fiber_result = result.clone();
            let coro = Coroutine::with_stack(stack, move |yielder, ()| {
                let c = unsafe {
                    // Safety: the trampoline only runs while the scheduler's
                    // registry holds the context alive.
                    ctx_ptr.as_ref()
                };
                c.yielder.set(Some(NonNull::from(yielder)));
                let value = f();
                *fiber_result.lock() = Some(value);
            });
            unsafe {
                // Safety: the fiber has never run; nothing else touches
                // `coro` before the dispatcher does.
                *ctx.coro.get() = Some(coro);
            }

            sched.register(ctx.clone());
            JoinHandle { ctx, result }
        }))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    /// Suspends the calling fiber until the target fiber terminates, then
    /// returns its value.
    ///
    /// # Panics
    ///
    /// Panics if the target has not yet terminated and the caller is not a
    /// fiber (there is nothing to suspend).
    pub fn join(self) -> T {
        loop {
            let mut join = self.ctx.join.lock();
            if join.completed {
                break;
            }
            let me = scheduler::current_context();
            unsafe {
                // Safety: `me` is the running fiber's context.
                me.as_ref()
            }
            .arm_wake();
            join.waiters.push(me);
            scheduler::suspend(join);
        }
        self.result
            .lock()
            .take()
            .expect("a joined fiber must have produced its value")
    }

    /// Whether the fiber has terminated. `join` will not suspend once this
    /// returns `true`.
    pub fn is_finished(&self) -> bool {
        self.ctx.join.lock().completed
    }

    /// Detaches the fiber, letting it run to completion unobserved.
    /// Equivalent to dropping the handle.
    pub fn detach(self) {}

    /// Takes the fiber's value if it has already terminated.
    pub(crate) fn into_result(self) -> Option<T> {
        self.result.lock().take()
    }
}

/// Spawns a fiber with the default [`Builder`] configuration.
///
/// # Panics
///
/// Panics if no scheduler is running on this thread or a stack cannot be
/// allocated; use [`Builder::spawn`] to handle the latter.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new()
        .spawn(f)
        .expect("failed to allocate a fiber stack")
}

/// Moves the calling fiber to the back of the ready queue, letting every
/// other ready fiber run before it continues.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Suspends the calling fiber for at least `duration`.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn sleep_for(duration: Duration) {
    scheduler::sleep_until(Instant::now() + duration);
}

/// Suspends the calling fiber until at least `deadline`.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn sleep_until(deadline: Instant) {
    scheduler::sleep_until(deadline);
}
