use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use log::{error, warn};

use crate::error::{TimerError, TimerResult};
use crate::task::TimerTask;
use crate::timeout::Timeout;
use crate::wheel::normalize_wheel_size;
use crate::worker::Worker;

const DEFAULT_TICK_MILLIS: u64 = 100;
const DEFAULT_TICKS_PER_WHEEL: usize = 512;
const DEFAULT_INIT_CAPACITY: usize = 2048;
const DEFAULT_THREAD_NAME: &str = "flywheel-timer";

const MILLISECOND_NANOS: i64 = 1_000_000;

pub(crate) const STATE_INIT: u8 = 0;
pub(crate) const STATE_STARTED: u8 = 1;
pub(crate) const STATE_SHUTDOWN: u8 = 2;

// A timer owns a dedicated thread and is meant to be shared, so creating one
// per connection is a usage error worth flagging once.
const INSTANCE_COUNT_LIMIT: usize = 64;
static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
static WARNED_TOO_MANY_INSTANCES: AtomicBool = AtomicBool::new(false);

fn acquire_instance() {
    if INSTANCE_COUNT.fetch_add(1, Ordering::AcqRel) + 1 > INSTANCE_COUNT_LIMIT
        && !WARNED_TOO_MANY_INSTANCES.swap(true, Ordering::AcqRel)
    {
        error!(
            "You Are Creating Too Many Timer Instances; A Timer Is A Shared Resource That \
             Should Be Reused Across The Application"
        );
    }
}

fn release_instance() {
    INSTANCE_COUNT.fetch_sub(1, Ordering::AcqRel);
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for configuring different options for a `Timer`.
pub struct TimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    max_pending: i64,
    init_capacity: usize,
    thread_name: String,
}

impl TimerBuilder {
    /// Sets the tick duration which sets the resolution for the timer.
    ///
    /// All timeouts are rounded up to a multiple of the tick duration.
    /// Durations below one millisecond are coerced up to one millisecond
    /// with a warning.
    pub fn with_tick_duration(mut self, duration: Duration) -> TimerBuilder {
        self.tick_duration = duration;
        self
    }

    /// Sets the number of buckets per wheel revolution.
    ///
    /// Normalized up to the next power of two, capped at 2^30. Larger wheels
    /// spread timeouts across more buckets at the cost of memory.
    pub fn with_ticks_per_wheel(mut self, ticks_per_wheel: usize) -> TimerBuilder {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Sets the maximum number of outstanding timeouts.
    ///
    /// Submissions beyond the ceiling are rejected. Zero or negative means
    /// unbounded.
    pub fn with_max_pending(mut self, max_pending: i64) -> TimerBuilder {
        self.max_pending = max_pending;
        self
    }

    /// Sets the initial capacity for timeout storage.
    pub fn with_init_capacity(mut self, init_capacity: usize) -> TimerBuilder {
        self.init_capacity = init_capacity;
        self
    }

    /// Sets the name given to the worker thread.
    pub fn with_thread_name<S: Into<String>>(mut self, thread_name: S) -> TimerBuilder {
        self.thread_name = thread_name.into();
        self
    }

    /// Get the tick duration that was set.
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Get the number of ticks per wheel that was set.
    pub fn ticks_per_wheel(&self) -> usize {
        self.ticks_per_wheel
    }

    /// Get the maximum number of pending timeouts that was set.
    pub fn max_pending(&self) -> i64 {
        self.max_pending
    }

    /// Get the initial capacity for timeout storage that was set.
    pub fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    /// Get the worker thread name that was set.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Build a new `Timer` from the current builder.
    pub fn build(self) -> TimerResult<Timer> {
        if self.ticks_per_wheel == 0 {
            return Err(TimerError::InvalidArgument(
                "ticks per wheel must be greater than zero",
            ));
        }
        let wheel_size = normalize_wheel_size(self.ticks_per_wheel);

        let tick_nanos = i64::try_from(self.tick_duration.as_nanos()).unwrap_or(i64::MAX);
        if tick_nanos == 0 {
            return Err(TimerError::InvalidArgument(
                "tick duration must be greater than zero",
            ));
        }
        if tick_nanos >= i64::MAX / wheel_size as i64 {
            return Err(TimerError::InvalidArgument(
                "tick duration in nanoseconds must stay below i64::MAX / wheel size",
            ));
        }
        let tick_nanos = if tick_nanos < MILLISECOND_NANOS {
            warn!(
                "Configured Tick Duration {}ns Is Smaller Than 1ms; Using 1ms",
                tick_nanos
            );
            MILLISECOND_NANOS
        } else {
            tick_nanos
        };

        acquire_instance();

        Ok(Timer {
            core: Arc::new(Core::new(
                tick_nanos,
                wheel_size,
                self.init_capacity,
                self.max_pending,
            )),
            worker: Mutex::new(None),
            thread_name: self.thread_name,
        })
    }
}

impl Default for TimerBuilder {
    fn default() -> TimerBuilder {
        TimerBuilder {
            tick_duration: Duration::from_millis(DEFAULT_TICK_MILLIS),
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            max_pending: -1,
            init_capacity: DEFAULT_INIT_CAPACITY,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

//--------------------------------------------------------------//

/// State shared between the facade, the caller-visible timeout handles, and
/// the worker thread. Everything here is either lock free or, in the case of
/// the start latch, only contended during startup.
pub(crate) struct Core {
    state: AtomicU8,
    tick_duration: i64,
    wheel_size: usize,
    init_capacity: usize,
    max_pending: i64,
    pending: AtomicI64,
    submitted: SegQueue<Timeout>,
    cancelled: SegQueue<Timeout>,
    anchor: Instant,
    start_time: AtomicI64,
    start_latch: Mutex<bool>,
    start_cond: Condvar,
}

impl Core {
    fn new(tick_duration: i64, wheel_size: usize, init_capacity: usize, max_pending: i64) -> Core {
        Core {
            state: AtomicU8::new(STATE_INIT),
            tick_duration,
            wheel_size,
            init_capacity,
            max_pending,
            pending: AtomicI64::new(0),
            submitted: SegQueue::new(),
            cancelled: SegQueue::new(),
            anchor: Instant::now(),
            start_time: AtomicI64::new(0),
            start_latch: Mutex::new(false),
            start_cond: Condvar::new(),
        }
    }

    /// Nanoseconds elapsed on the monotonic clock since this timer was built.
    pub(crate) fn now(&self) -> i64 {
        i64::try_from(self.anchor.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn transition(&self, from: u8, to: u8) -> Result<u8, u8> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Force the lifecycle to `Shutdown`, returning the previous state.
    fn force_shutdown(&self) -> u8 {
        self.state.swap(STATE_SHUTDOWN, Ordering::AcqRel)
    }

    pub(crate) fn tick_duration(&self) -> i64 {
        self.tick_duration
    }

    pub(crate) fn wheel_size(&self) -> usize {
        self.wheel_size
    }

    pub(crate) fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    pub(crate) fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::Acquire)
    }

    /// Sample and publish the worker's start time, waking every thread
    /// blocked in `start()`. A real sample of zero is rewritten to one so
    /// zero stays the "not yet initialized" sentinel.
    pub(crate) fn publish_start_time(&self) -> i64 {
        let mut now = self.now();
        if now == 0 {
            now = 1;
        }
        self.start_time.store(now, Ordering::Release);

        let mut started = lock_ignoring_poison(&self.start_latch);
        *started = true;
        self.start_cond.notify_all();
        now
    }

    fn wait_started(&self) {
        let mut started = lock_ignoring_poison(&self.start_latch);
        while !*started {
            started = self
                .start_cond
                .wait(started)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn increment_pending(&self) -> i64 {
        self.pending.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn decrement_pending(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn enqueue_cancelled(&self, timeout: Timeout) {
        self.cancelled.push(timeout);
    }

    pub(crate) fn pop_submitted(&self) -> Option<Timeout> {
        self.submitted.pop()
    }

    pub(crate) fn pop_cancelled(&self) -> Option<Timeout> {
        self.cancelled.pop()
    }
}

//--------------------------------------------------------------//

/// Timer that schedules approximate one-shot timeouts on a hashed wheel.
///
/// Timeouts are handed to a single worker thread through lock-free queues;
/// the worker buckets them by deadline and checks one bucket per tick, so
/// insertion, cancellation, and expiry processing are all amortized O(1).
/// Expiry is approximate: a timeout fires no earlier than its delay and no
/// later than roughly one tick past it (plus one wheel revolution for
/// entries far in the future).
pub struct Timer {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<Vec<Timeout>>>>,
    thread_name: String,
}

impl Timer {
    /// Schedule `task` to run once, approximately `delay` from now.
    ///
    /// Starts the worker thread on first use. Returns a handle that can be
    /// used to cancel the timeout or query its state; the entry is linked
    /// into the wheel asynchronously on the worker's next tick.
    ///
    /// A submission racing a concurrent `stop()` may be accepted here yet
    /// land after the worker's final drain, in which case it neither runs
    /// nor appears in the unprocessed set returned by `stop()`. Callers
    /// coordinating shutdown should stop submitting before calling `stop()`.
    pub fn schedule<T>(&self, delay: Duration, task: T) -> TimerResult<Timeout>
    where
        T: TimerTask,
    {
        let pending = self.core.increment_pending();
        if self.core.max_pending > 0 && pending > self.core.max_pending {
            self.core.decrement_pending();
            return Err(TimerError::Rejected {
                pending,
                max_pending: self.core.max_pending,
            });
        }

        if let Err(error) = self.start() {
            self.core.decrement_pending();
            return Err(error);
        }

        let delay_nanos = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        // Relative to the worker's start time; clamped instead of wrapping
        // when the delay would overflow the nanosecond range.
        let deadline = self
            .core
            .now()
            .saturating_add(delay_nanos)
            .saturating_sub(self.core.start_time());

        let timeout = Timeout::new(self.core.clone(), Box::new(task), deadline);
        self.core.submitted.push(timeout.clone());
        Ok(timeout)
    }

    /// Start the worker thread explicitly.
    ///
    /// Idempotent; the thread also starts on demand from `schedule`. Blocks
    /// until the worker has published its start time, so every caller
    /// observes a valid time base before computing deadlines.
    pub fn start(&self) -> TimerResult<()> {
        {
            let mut worker = lock_ignoring_poison(&self.worker);
            match self.core.transition(STATE_INIT, STATE_STARTED) {
                Ok(_) => {
                    let core = self.core.clone();
                    let spawned = thread::Builder::new()
                        .name(self.thread_name.clone())
                        .spawn(move || Worker::new(core).run());
                    match spawned {
                        Ok(handle) => *worker = Some(handle),
                        Err(error) => {
                            // No worker will ever publish a start time, so the
                            // timer is unusable; retire it instead of leaving
                            // callers blocked on the start latch.
                            if self.core.force_shutdown() != STATE_SHUTDOWN {
                                release_instance();
                            }
                            return Err(TimerError::WorkerSpawn(error));
                        }
                    }
                }
                Err(STATE_STARTED) => (),
                Err(_) => {
                    return Err(TimerError::IllegalState(
                        "timer cannot be started once stopped",
                    ))
                }
            }
        }

        self.core.wait_started();
        Ok(())
    }

    /// Stop the timer and return every timeout that was neither expired nor
    /// cancelled.
    ///
    /// A second call is a no-op returning an empty set. Calling this from a
    /// task running on the worker thread fails instead of deadlocking.
    pub fn stop(&self) -> TimerResult<Vec<Timeout>> {
        {
            let worker = lock_ignoring_poison(&self.worker);
            if let Some(handle) = worker.as_ref() {
                if thread::current().id() == handle.thread().id() {
                    return Err(TimerError::IllegalState(
                        "stop() cannot be called from the timer worker thread",
                    ));
                }
            }
        }

        if self.core.transition(STATE_STARTED, STATE_SHUTDOWN).is_err() {
            // Never started, or another stop got here first.
            if self.core.force_shutdown() != STATE_SHUTDOWN {
                release_instance();
            }
            return Ok(Vec::new());
        }
        release_instance();

        let handle = lock_ignoring_poison(&self.worker).take();
        let unprocessed = match handle {
            Some(handle) => {
                // Wake the worker out of its tick sleep so it can drain.
                handle.thread().unpark();
                match handle.join() {
                    Ok(unprocessed) => unprocessed,
                    Err(_) => {
                        error!("Timer Worker Thread Died Before Handing Back Unprocessed Timeouts");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        Ok(unprocessed)
    }

    /// Snapshot of the number of outstanding timeouts.
    ///
    /// Advisory only; concurrent submissions and cancellations may change
    /// the count immediately after the read.
    pub fn pending_timeouts(&self) -> i64 {
        self.core.pending.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> Arc<Core> {
        self.core.clone()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.core.force_shutdown() != STATE_SHUTDOWN {
            release_instance();
        }
        // Wake the worker so it drains and exits; dropping the handle
        // detaches the thread rather than blocking here.
        if let Some(handle) = lock_ignoring_poison(&self.worker).take() {
            handle.thread().unpark();
        }
    }
}
