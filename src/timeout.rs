use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;

use crate::task::TimerTask;
use crate::timer::Core;

const STATE_INIT: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// Slot value for an entry that was never linked into the wheel.
pub(crate) const SLOT_NONE: usize = usize::MAX;
/// Slot value for an entry that left the wheel and released its pending count.
pub(crate) const SLOT_DETACHED: usize = usize::MAX - 1;

/// Handle to a single scheduled timeout.
///
/// The handle is cheap to clone and can be used from any thread to cancel
/// the timeout or to query whether it has already been cancelled or expired.
/// State moves from its initial value to exactly one of cancelled or expired,
/// decided by a compare-and-swap, so a cancellation racing the worker's
/// expiry is resolved without double invocation.
#[derive(Clone)]
pub struct Timeout {
    entry: Arc<Entry>,
}

struct Entry {
    core: Arc<Core>,
    task: Box<dyn TimerTask>,
    // Nanosecond offset relative to the timer's start time.
    deadline: i64,
    state: AtomicU8,
    // Slab key of the wheel node holding this entry, or one of the
    // sentinels above. Written and read only by the worker thread.
    slot: AtomicUsize,
}

impl Timeout {
    pub(crate) fn new(core: Arc<Core>, task: Box<dyn TimerTask>, deadline: i64) -> Timeout {
        Timeout {
            entry: Arc::new(Entry {
                core,
                task,
                deadline,
                state: AtomicU8::new(STATE_INIT),
                slot: AtomicUsize::new(SLOT_NONE),
            }),
        }
    }

    /// Attempt to cancel this timeout.
    ///
    /// Returns whether this call won the cancellation race; `false` means the
    /// timeout was already cancelled or has already expired. Cancellation
    /// never blocks and never touches the wheel directly; the worker unlinks
    /// the entry within one tick.
    pub fn cancel(&self) -> bool {
        if self
            .entry
            .state
            .compare_exchange(STATE_INIT, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Only the state flips here; the wheel cleanup happens on the worker
        // thread when it drains the cancellation queue on its next tick.
        self.entry.core.enqueue_cancelled(self.clone());
        true
    }

    /// Whether this timeout has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    /// Whether this timeout has expired (its task has been invoked).
    pub fn is_expired(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == STATE_EXPIRED
    }

    pub(crate) fn deadline(&self) -> i64 {
        self.entry.deadline
    }

    pub(crate) fn slot(&self) -> usize {
        self.entry.slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.entry.slot.store(slot, Ordering::Relaxed);
    }

    /// Mark the entry as expired and run its task, swallowing panics.
    pub(crate) fn expire(&self) {
        if self
            .entry
            .state
            .compare_exchange(STATE_INIT, STATE_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let handle = self.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| self.entry.task.run(handle))).is_err() {
            warn!("A TimerTask Panicked While Expiring; Panic Was Discarded");
        }
    }

    /// Release the entry's pending count once it has left the engine.
    pub(crate) fn release(&self) {
        self.entry.slot.store(SLOT_DETACHED, Ordering::Relaxed);
        self.entry.core.decrement_pending();
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline_ns", &self.entry.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::timer::TimerBuilder;
    use crate::Timeout;

    fn unstarted_timeout(deadline: i64) -> Timeout {
        let timer = TimerBuilder::default().build().unwrap();
        Timeout::new(timer.core(), Box::new(|_: Timeout| {}), deadline)
    }

    #[test]
    fn positive_cancel_wins_once() {
        let timeout = unstarted_timeout(0);

        assert!(timeout.cancel());
        assert!(!timeout.cancel());
        assert!(timeout.is_cancelled());
        assert!(!timeout.is_expired());
    }

    #[test]
    fn positive_expire_is_terminal() {
        let timer = TimerBuilder::default().build().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let timeout = Timeout::new(
            timer.core(),
            Box::new(move |_: Timeout| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        timeout.expire();
        timeout.expire();

        assert_eq!(1, runs.load(Ordering::SeqCst));
        assert!(timeout.is_expired());
        assert!(!timeout.cancel());
    }

    #[test]
    fn positive_cancelled_timeout_never_runs() {
        let timer = TimerBuilder::default().build().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let timeout = Timeout::new(
            timer.core(),
            Box::new(move |_: Timeout| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        assert!(timeout.cancel());
        timeout.expire();

        assert_eq!(0, runs.load(Ordering::SeqCst));
        assert!(timeout.is_cancelled());
    }

    #[test]
    fn positive_panicking_task_is_contained() {
        let timer = TimerBuilder::default().build().unwrap();
        let timeout = Timeout::new(
            timer.core(),
            Box::new(|_: Timeout| {
                panic!("task blew up");
            }),
            0,
        );

        timeout.expire();
        assert!(timeout.is_expired());
    }
}
