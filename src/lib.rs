#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! A stackful fiber runtime.
//!
//! `hypha` multiplexes lightweight cooperative tasks (*fibers*, each with
//! its own call stack) onto the OS threads that run them. Every thread
//! hosts at most one [`Scheduler`]; fibers suspend only at explicit points
//! (channel operations, condition waits, [`yield_now`], sleeps) and never
//! migrate between threads.
//!
//! On top of the scheduler sit the crate's synchronization primitives:
//!
//! - [`sync::UnbufferedChannel`], a rendezvous channel that moves each
//!   value directly from a producer fiber to a consumer fiber;
//! - [`sync::Mutex`] and [`sync::Condvar`], the classic predicate-wait
//!   pair, suspending fibers instead of threads;
//! - [`sync::Broadcast`], a serialized fan-out of typed events to
//!   subscriber callbacks, usable from any thread.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hypha::sync::UnbufferedChannel;
//!
//! let total = hypha::run(|| {
//!     let chan = Arc::new(UnbufferedChannel::new());
//!
//!     let tx = chan.clone();
//!     hypha::spawn(move || {
//!         for n in 1..=10 {
//!             tx.push(n).expect("channel closed");
//!         }
//!         tx.close();
//!     })
//!     .detach();
//!
//!     chan.iter().sum::<i32>()
//! });
//! assert_eq!(total, 55);
//! ```
//!
//! # Threads and schedulers
//!
//! [`run`] owns the calling thread until every fiber spawned on it has
//! terminated. Separate threads may each call [`run`]; the channel and the
//! broadcast sink are safe to share across them, and waking a fiber on
//! another thread's scheduler is handled transparently.

mod context;
mod list;

pub mod error;
pub mod fiber;
pub mod scheduler;
pub mod sync;

pub use fiber::{sleep_for, sleep_until, spawn, yield_now, Builder, JoinHandle};
pub use scheduler::{run, Scheduler};
