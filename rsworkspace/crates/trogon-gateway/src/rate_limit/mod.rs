//! Fixed-window per-user rate limiting.
//!
//! Every user gets `capacity` requests per window. A window starts with the
//! user's first request and ends `interval` later; the next request after that
//! starts a fresh window with the full quota again. There is no proportional
//! refill: a user who exhausts the quota one second into the window waits the
//! remaining `interval - 1s`.

mod store;

use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, SystemClock};

pub use store::{BucketStore, MemoryBucketStore, RateBucket};

pub struct RateLimiter<S = MemoryBucketStore, C = SystemClock> {
    store: S,
    clock: C,
    capacity: u32,
    interval: Duration,
}

impl RateLimiter {
    /// In-memory limiter on the system clock.
    ///
    /// `capacity` and `interval` are expected to be non-zero; [`crate::config`]
    /// substitutes defaults before they get here.
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self::with_store_and_clock(MemoryBucketStore::new(), SystemClock, capacity, interval)
    }
}

impl<S: BucketStore, C: Clock> RateLimiter<S, C> {
    pub fn with_store_and_clock(store: S, clock: C, capacity: u32, interval: Duration) -> Self {
        debug_assert!(capacity > 0, "rate limit capacity must be positive");
        debug_assert!(!interval.is_zero(), "rate limit interval must be positive");
        Self {
            store,
            clock,
            capacity,
            interval,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of users currently holding a bucket.
    pub fn tracked(&self) -> usize {
        self.store.len()
    }

    /// Take one unit of quota for `identity`. Returns `false` when the
    /// current window is used up.
    pub fn allow(&self, identity: &str) -> bool {
        loop {
            let now = self.clock.now();
            let current = self.store.get(identity);
            let (next, allowed) = self.take(current, now);

            if current == Some(next) {
                return allowed;
            }
            if self.store.compare_and_swap(identity, current, next) {
                return allowed;
            }
            // Lost a race with a concurrent request for the same user; re-read.
        }
    }

    /// Drop buckets whose window has already run out.
    ///
    /// Such a bucket would be reset to full quota on its owner's next request
    /// anyway, so removing it never changes what [`allow`](Self::allow) answers.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let removed = self
            .store
            .retain(|_, bucket| !self.window_expired(bucket, now));
        if removed > 0 {
            debug!(removed, tracked = self.store.len(), "Evicted idle rate-limit buckets");
        }
        removed
    }

    fn take(&self, current: Option<RateBucket>, now: tokio::time::Instant) -> (RateBucket, bool) {
        let mut bucket = match current {
            Some(bucket) if !self.window_expired(&bucket, now) => bucket,
            _ => RateBucket::full(self.capacity, now),
        };

        if bucket.remaining == 0 {
            return (bucket, false);
        }
        bucket.remaining -= 1;
        (bucket, true)
    }

    fn window_expired(&self, bucket: &RateBucket, now: tokio::time::Instant) -> bool {
        now.duration_since(bucket.last_reset) >= self.interval
    }
}
