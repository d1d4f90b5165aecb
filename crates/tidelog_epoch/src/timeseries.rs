//! Fixed-window bucketed series of stall durations.
//!
//! A ring of buckets covering a sliding window. Buckets carry an absolute
//! index so stale slots are recognized by id rather than eagerly cleared;
//! the structure allocates only at construction.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Default)]
struct Bucket {
    id: u64,
    sum_us: u64,
    count: u64,
}

pub struct BucketedStallSeries {
    origin: Instant,
    bucket_width_us: u64,
    buckets: Vec<Bucket>,
    /// Absolute id of the most recent bucket observed.
    latest: u64,
}

impl BucketedStallSeries {
    pub fn new(num_buckets: usize, window: Duration, origin: Instant) -> Self {
        assert!(num_buckets > 0);
        let bucket_width_us = (window.as_micros() as u64 / num_buckets as u64).max(1);
        Self {
            origin,
            bucket_width_us,
            buckets: vec![Bucket::default(); num_buckets],
            latest: 0,
        }
    }

    fn bucket_id(&self, at: Instant) -> u64 {
        let offset_us = at.saturating_duration_since(self.origin).as_micros() as u64;
        offset_us / self.bucket_width_us
    }

    /// Move the series forward so that buckets older than the window fall
    /// out of subsequent queries.
    pub fn advance(&mut self, now: Instant) {
        self.latest = self.latest.max(self.bucket_id(now));
    }

    /// Record one stall observed at `at`. Samples older than the retained
    /// window are dropped.
    pub fn add(&mut self, at: Instant, duration: Duration) {
        let id = self.bucket_id(at);
        let n = self.buckets.len() as u64;
        if id + n <= self.latest {
            return;
        }
        self.latest = self.latest.max(id);
        let slot = &mut self.buckets[(id % n) as usize];
        if slot.id != id {
            *slot = Bucket {
                id,
                sum_us: 0,
                count: 0,
            };
        }
        slot.sum_us += duration.as_micros() as u64;
        slot.count += 1;
    }

    /// Total stall duration within `[from, to)`.
    pub fn sum(&self, from: Instant, to: Instant) -> Duration {
        Duration::from_micros(self.aggregate(from, to).0)
    }

    /// Number of stalls within `[from, to)`.
    pub fn count(&self, from: Instant, to: Instant) -> u64 {
        self.aggregate(from, to).1
    }

    fn aggregate(&self, from: Instant, to: Instant) -> (u64, u64) {
        let from_us = from.saturating_duration_since(self.origin).as_micros() as u64;
        let to_us = to.saturating_duration_since(self.origin).as_micros() as u64;
        let n = self.buckets.len() as u64;
        let mut sum_us = 0;
        let mut count = 0;
        for bucket in &self.buckets {
            if bucket.count == 0 || bucket.id + n <= self.latest {
                continue;
            }
            let start = bucket.id * self.bucket_width_us;
            let end = start + self.bucket_width_us;
            if start < to_us && end > from_us {
                sum_us += bucket.sum_us;
                count += bucket.count;
            }
        }
        (sum_us, count)
    }
}
