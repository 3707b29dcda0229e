use std::cmp;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::timeout::{Timeout, SLOT_DETACHED, SLOT_NONE};
use crate::timer::{Core, STATE_SHUTDOWN, STATE_STARTED};
use crate::wheel::Wheel;

// Ceiling on submission-queue entries moved into buckets in one tick, so a
// producer flooding the queue cannot hold a tick hostage.
const MAX_TRANSFERS_PER_TICK: usize = 100_000;

/// The single consumer thread driving a `Timer`.
///
/// All wheel mutation happens here: the worker drains both hand-off queues,
/// assigns entries to buckets, expires due entries, and unlinks cancelled
/// ones. Caller threads only ever push onto the queues.
pub(crate) struct Worker {
    core: Arc<Core>,
    wheel: Wheel,
    tick: u64,
    start_time: i64,
    unprocessed: Vec<Timeout>,
}

impl Worker {
    pub fn new(core: Arc<Core>) -> Worker {
        let wheel = Wheel::new(core.wheel_size(), core.init_capacity());

        Worker {
            core,
            wheel,
            tick: 0,
            start_time: 0,
            unprocessed: Vec::new(),
        }
    }

    /// Run until the lifecycle leaves `Started`, then drain everything that
    /// neither expired nor was cancelled and hand it back to `stop()`.
    pub fn run(mut self) -> Vec<Timeout> {
        self.start_time = self.core.publish_start_time();

        loop {
            if let Some(tick_time) = self.wait_for_next_tick() {
                let index = (self.tick & self.wheel.mask()) as usize;
                self.process_cancelled();
                self.transfer_to_buckets();
                self.wheel.expire(index, tick_time);
                self.tick += 1;
            }

            if self.core.state() != STATE_STARTED {
                break;
            }
        }

        self.wheel.clear(&mut self.unprocessed);
        while let Some(timeout) = self.core.pop_submitted() {
            if !timeout.is_cancelled() {
                timeout.release();
                self.unprocessed.push(timeout);
            }
        }
        // Entries cancelled but never removed still hold a pending count.
        self.process_cancelled();

        debug!(
            "Timer Worker Shutting Down After {} Ticks With {} Unprocessed Timeouts",
            self.tick,
            self.unprocessed.len()
        );
        self.unprocessed
    }

    /// Sleep until the next tick's target offset is reached, recomputing the
    /// remaining time on every wake-up. Returns the current offset relative
    /// to the start time, or `None` if shutdown was observed while waiting.
    fn wait_for_next_tick(&self) -> Option<i64> {
        let deadline = self
            .core
            .tick_duration()
            .saturating_mul(self.tick as i64 + 1);

        loop {
            let current = self.core.now() - self.start_time;
            if current >= deadline {
                return Some(current);
            }

            thread::park_timeout(Duration::from_nanos((deadline - current) as u64));

            if self.core.state() == STATE_SHUTDOWN {
                return None;
            }
        }
    }

    /// Drain the cancellation queue fully, unlinking each entry from
    /// whatever bucket holds it. Entries that were never linked release
    /// their pending count directly; entries already unlinked are no-ops.
    fn process_cancelled(&mut self) {
        while let Some(timeout) = self.core.pop_cancelled() {
            match timeout.slot() {
                SLOT_DETACHED => (),
                SLOT_NONE => timeout.release(),
                key => {
                    self.wheel.remove(key);
                }
            }
        }
    }

    /// Move queued submissions into their target buckets, computing each
    /// entry's remaining rounds from its deadline.
    fn transfer_to_buckets(&mut self) {
        for _ in 0..MAX_TRANSFERS_PER_TICK {
            let timeout = match self.core.pop_submitted() {
                Some(timeout) => timeout,
                None => break,
            };
            if timeout.is_cancelled() {
                // Cancelled while still queued; the cancellation pass settles
                // its pending count.
                continue;
            }

            let calculated = timeout.deadline() / self.core.tick_duration();
            let remaining_rounds = (calculated - self.tick as i64) / self.wheel.len() as i64;
            // Ensure we don't schedule into the past.
            let ticks = cmp::max(calculated, self.tick as i64);
            let index = (ticks as u64 & self.wheel.mask()) as usize;

            self.wheel.add(index, timeout, remaining_rounds);
        }
    }
}
