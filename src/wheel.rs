use std::cmp;

use log::error;
use slab::Slab;

use crate::timeout::{Timeout, SLOT_NONE};

/// Largest supported number of buckets (2^30).
pub(crate) const MAX_WHEEL_SIZE: usize = 1 << 30;

/// Normalize a bucket count up to the next power of two, capped at 2^30.
pub(crate) fn normalize_wheel_size(ticks_per_wheel: usize) -> usize {
    cmp::max(ticks_per_wheel, 1)
        .min(MAX_WHEEL_SIZE)
        .next_power_of_two()
}

/// One wheel slot; the head and tail of an intrusive list of arena nodes.
#[derive(Clone, Copy, Default)]
struct Bucket {
    head: Option<usize>,
    tail: Option<usize>,
}

struct Node {
    timeout: Timeout,
    // Full revolutions left before the entry is eligible to expire. May be
    // negative for overdue entries, which expire like round zero.
    remaining_rounds: i64,
    bucket: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed power-of-two array of buckets whose nodes live in a shared slab.
///
/// Only the worker thread ever touches the wheel, so none of the list
/// manipulation here needs synchronization. Entries always have their links
/// and slot reference cleared when they leave a bucket, which keeps removal
/// idempotent from the cancellation path.
pub(crate) struct Wheel {
    buckets: Box<[Bucket]>,
    mask: u64,
    storage: Slab<Node>,
}

impl Wheel {
    pub fn new(num_buckets: usize, init_capacity: usize) -> Wheel {
        debug_assert!(num_buckets.is_power_of_two());

        Wheel {
            buckets: vec![Bucket::default(); num_buckets].into_boxed_slice(),
            mask: (num_buckets - 1) as u64,
            storage: Slab::with_capacity(init_capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Append an entry to the tail of the given bucket's list.
    pub fn add(&mut self, bucket_index: usize, timeout: Timeout, remaining_rounds: i64) {
        let tail = self.buckets[bucket_index].tail;
        let key = self.storage.insert(Node {
            timeout,
            remaining_rounds,
            bucket: bucket_index,
            prev: tail,
            next: None,
        });
        self.storage[key].timeout.set_slot(key);

        match tail {
            Some(tail_key) => self.storage[tail_key].next = Some(key),
            None => self.buckets[bucket_index].head = Some(key),
        }
        self.buckets[bucket_index].tail = Some(key);
    }

    /// Unlink the node at `key` from its bucket and release the entry's
    /// pending count. Returns the key that followed it in list order.
    pub fn remove(&mut self, key: usize) -> Option<usize> {
        let node = self.storage.remove(key);

        if let Some(prev) = node.prev {
            self.storage[prev].next = node.next;
        }
        if let Some(next) = node.next {
            self.storage[next].prev = node.prev;
        }

        let bucket = &mut self.buckets[node.bucket];
        if bucket.head == Some(key) {
            bucket.head = node.next;
        }
        if bucket.tail == Some(key) {
            bucket.tail = node.prev;
        }

        node.timeout.release();
        node.next
    }

    /// Walk the bucket for the current tick once, expiring every entry whose
    /// rounds are exhausted and whose deadline is due, dropping cancelled
    /// entries found in place, and decrementing the rounds of the rest.
    pub fn expire(&mut self, bucket_index: usize, deadline: i64) {
        let mut cursor = self.buckets[bucket_index].head;

        while let Some(key) = cursor {
            let due = self.storage[key].remaining_rounds <= 0;

            if due {
                let timeout = self.storage[key].timeout.clone();
                cursor = self.remove(key);

                if timeout.deadline() <= deadline {
                    timeout.expire();
                } else {
                    // The entry landed in the wrong slot. This indicates a
                    // defect in the scheduling engine itself and should be
                    // unreachable; drop the entry rather than the worker.
                    error!(
                        "Timeout Deadline ({}) Exceeds Tick Deadline ({}); Entry Was Placed In The Wrong Slot",
                        timeout.deadline(),
                        deadline
                    );
                }
            } else if self.storage[key].timeout.is_cancelled() {
                cursor = self.remove(key);
            } else {
                let node = &mut self.storage[key];
                node.remaining_rounds -= 1;
                cursor = node.next;
            }
        }
    }

    /// Drain every bucket at shutdown.
    ///
    /// Entries that are neither expired nor cancelled are released and pushed
    /// onto `unprocessed`. Cancelled entries are detached with their slot
    /// reset, leaving the final cancellation-queue pass to release them.
    pub fn clear(&mut self, unprocessed: &mut Vec<Timeout>) {
        for bucket in self.buckets.iter_mut() {
            *bucket = Bucket::default();
        }

        for node in self.storage.drain() {
            if node.timeout.is_cancelled() {
                node.timeout.set_slot(SLOT_NONE);
            } else if !node.timeout.is_expired() {
                node.timeout.release();
                unprocessed.push(node.timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{normalize_wheel_size, Wheel, MAX_WHEEL_SIZE};
    use crate::timeout::{Timeout, SLOT_DETACHED};
    use crate::timer::TimerBuilder;

    fn counting_timeout(deadline: i64, fired: &Arc<AtomicUsize>) -> Timeout {
        let timer = TimerBuilder::default().build().unwrap();
        let counter = fired.clone();
        Timeout::new(
            timer.core(),
            Box::new(move |_: Timeout| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            deadline,
        )
    }

    #[test]
    fn positive_normalize_rounds_up_to_power_of_two() {
        assert_eq!(1, normalize_wheel_size(1));
        assert_eq!(8, normalize_wheel_size(5));
        assert_eq!(512, normalize_wheel_size(512));
        assert_eq!(1024, normalize_wheel_size(513));
    }

    #[test]
    fn positive_normalize_caps_at_max() {
        assert_eq!(MAX_WHEEL_SIZE, normalize_wheel_size(MAX_WHEEL_SIZE));
        assert_eq!(MAX_WHEEL_SIZE, normalize_wheel_size(MAX_WHEEL_SIZE + 1));
        assert_eq!(MAX_WHEEL_SIZE, normalize_wheel_size(usize::MAX));
    }

    #[test]
    fn positive_expire_fires_due_entries_in_list_order() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut wheel = Wheel::new(8, 8);

        wheel.add(3, counting_timeout(0, &fired), 0);
        wheel.add(3, counting_timeout(0, &fired), 0);

        wheel.expire(3, 100);
        assert_eq!(2, fired.load(Ordering::SeqCst));

        // The bucket is empty afterwards.
        wheel.expire(3, 200);
        assert_eq!(2, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn positive_expire_decrements_rounds_before_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut wheel = Wheel::new(8, 8);

        wheel.add(0, counting_timeout(0, &fired), 1);

        wheel.expire(0, 100);
        assert_eq!(0, fired.load(Ordering::SeqCst));

        wheel.expire(0, 200);
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn positive_expire_drops_cancelled_entry_without_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut wheel = Wheel::new(8, 8);

        let timeout = counting_timeout(0, &fired);
        wheel.add(2, timeout.clone(), 5);
        assert!(timeout.cancel());

        wheel.expire(2, 100);

        assert_eq!(0, fired.load(Ordering::SeqCst));
        assert_eq!(SLOT_DETACHED, timeout.slot());
    }

    #[test]
    fn positive_remove_relinks_neighbors() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut wheel = Wheel::new(8, 8);

        let first = counting_timeout(0, &fired);
        let middle = counting_timeout(0, &fired);
        let last = counting_timeout(0, &fired);
        wheel.add(1, first, 0);
        wheel.add(1, middle.clone(), 0);
        wheel.add(1, last, 0);

        wheel.remove(middle.slot());

        wheel.expire(1, 100);
        assert_eq!(2, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn positive_clear_returns_live_entries() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut wheel = Wheel::new(8, 8);

        let live = counting_timeout(0, &fired);
        let cancelled = counting_timeout(0, &fired);
        wheel.add(4, live, 3);
        wheel.add(6, cancelled.clone(), 3);
        assert!(cancelled.cancel());

        let mut unprocessed = Vec::new();
        wheel.clear(&mut unprocessed);

        assert_eq!(1, unprocessed.len());
        assert!(!unprocessed[0].is_cancelled());
        assert!(!unprocessed[0].is_expired());
    }
}
