//! User supplied work that runs when a timeout expires.

use crate::timeout::Timeout;

/// A unit of work invoked once when its timeout fires.
///
/// The task receives a handle to its own `Timeout`, which it may use to
/// inspect its state or keep for bookkeeping. A panic escaping `run` is
/// caught and logged by the timer; it never affects other timeouts or the
/// worker thread.
pub trait TimerTask: Send + Sync + 'static {
    /// Run the task for the given (now expired) timeout.
    fn run(&self, timeout: Timeout);
}

impl<F> TimerTask for F
where
    F: Fn(Timeout) + Send + Sync + 'static,
{
    fn run(&self, timeout: Timeout) {
        (self)(timeout)
    }
}
