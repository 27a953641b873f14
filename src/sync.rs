//! Synchronization primitives for fibers.
//!
//! Everything here coordinates fibers, not OS threads (with two exceptions:
//! [`Spinlock`] is an ordinary busy-wait lock, and [`Broadcast`] is usable
//! from any thread). The suspending primitives ([`Mutex`], [`Condvar`],
//! [`UnbufferedChannel`]) park the calling *fiber* on an intrusive wait
//! list and hand the thread to the next runnable fiber; they may be shared
//! freely between fibers on different schedulers.

pub mod broadcast;
pub mod channel;
pub mod condvar;
pub mod mutex;
pub mod spin;

pub use self::broadcast::{Broadcast, Token};
pub use self::channel::UnbufferedChannel;
pub use self::condvar::{Condvar, WaitTimeoutResult};
pub use self::mutex::{Mutex, MutexGuard};
pub use self::spin::{Spinlock, SpinGuard};
