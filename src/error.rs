//! Errors that a `Timer` can produce.

use std::error::Error;
use std::fmt;
use std::io;

/// Result type for `Timer` operations.
pub type TimerResult<T> = Result<T, TimerError>;

/// Error type for `Timer` operations.
#[derive(Debug)]
pub enum TimerError {
    /// A configuration value was zero, negative, or out of range.
    InvalidArgument(&'static str),
    /// The operation is not valid for the timer's current lifecycle state.
    IllegalState(&'static str),
    /// The pending timeout ceiling was reached; back off or raise the ceiling.
    Rejected {
        pending: i64,
        max_pending: i64,
    },
    /// The operating system refused to spawn the worker thread.
    WorkerSpawn(io::Error),
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimerError::InvalidArgument(message) => {
                write!(f, "invalid argument: {}", message)
            }
            TimerError::IllegalState(message) => {
                write!(f, "illegal state: {}", message)
            }
            TimerError::Rejected { pending, max_pending } => {
                write!(
                    f,
                    "number of pending timeouts ({}) is greater than maximum allowed pending timeouts ({})",
                    pending, max_pending
                )
            }
            TimerError::WorkerSpawn(error) => {
                write!(f, "failed to spawn the timer worker thread: {}", error)
            }
        }
    }
}

impl Error for TimerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TimerError::WorkerSpawn(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for TimerError {
    fn from(error: io::Error) -> TimerError {
        TimerError::WorkerSpawn(error)
    }
}
