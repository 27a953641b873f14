//! Errors returned by channel operations.
//!
//! Blocking channel calls report their outcome in the `Result`: a push that
//! cannot complete hands the rejected value back inside the error, so
//! nothing is ever silently dropped.

use core::fmt;

/// Error returned by [`UnbufferedChannel::push`] when the channel is
/// closed. The rejected value is returned to the caller.
///
/// [`UnbufferedChannel::push`]: crate::sync::UnbufferedChannel::push
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    /// The channel is closed; the value was not delivered.
    Closed(T),
}

/// Error returned by the timed push operations. The rejected value is
/// returned to the caller in either variant.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum SendTimeoutError<T> {
    /// The channel is closed; the value was not delivered.
    Closed(T),
    /// The deadline passed before any consumer arrived; the value was not
    /// delivered.
    Timeout(T),
}

/// Error returned by [`UnbufferedChannel::pop`] when the channel is closed
/// and drained: there is no value to hand out and there never will be.
///
/// [`UnbufferedChannel::pop`]: crate::sync::UnbufferedChannel::pop
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    /// The channel is closed and no value remains.
    Closed,
}

/// Error returned by the timed pop operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvTimeoutError {
    /// The channel is closed and no value remains.
    Closed,
    /// The deadline passed before any producer arrived.
    Timeout,
}

// === impl SendError ===

impl<T> SendError<T> {
    /// Consumes the error, returning the undelivered value.
    #[inline]
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("SendError::Closed(..)"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel closed")
    }
}

impl<T> std::error::Error for SendError<T> {}

// === impl SendTimeoutError ===

impl<T> SendTimeoutError<T> {
    /// Consumes the error, returning the undelivered value.
    #[inline]
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(value) | Self::Timeout(value) => value,
        }
    }

    /// Whether this is the [`Timeout`](Self::Timeout) variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl<T> fmt::Debug for SendTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("SendTimeoutError::Closed(..)"),
            Self::Timeout(_) => f.write_str("SendTimeoutError::Timeout(..)"),
        }
    }
}

impl<T> fmt::Display for SendTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("channel closed"),
            Self::Timeout(_) => f.write_str("push timed out"),
        }
    }
}

impl<T> std::error::Error for SendTimeoutError<T> {}

// === impl RecvError ===

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel closed")
    }
}

impl std::error::Error for RecvError {}

// === impl RecvTimeoutError ===

impl RecvTimeoutError {
    /// Whether this is the [`Timeout`](Self::Timeout) variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("channel closed"),
            Self::Timeout => f.write_str("pop timed out"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}
