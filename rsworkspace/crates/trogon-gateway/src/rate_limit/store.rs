//! [`BucketStore`] trait and its in-memory backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

/// Quota state for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateBucket {
    pub remaining: u32,
    pub last_reset: Instant,
}

impl RateBucket {
    pub fn full(capacity: u32, now: Instant) -> Self {
        Self {
            remaining: capacity,
            last_reset: now,
        }
    }
}

/// Storage for per-user buckets.
///
/// The limiter only ever reads a bucket and then writes it back with
/// [`compare_and_swap`](BucketStore::compare_and_swap), so a backend only has
/// to make that single swap atomic for the read-check-modify to be race free.
pub trait BucketStore: Send + Sync + 'static {
    fn get(&self, identity: &str) -> Option<RateBucket>;

    /// Store `new` only if the current value still equals `expected`
    /// (`None` meaning "no bucket yet"). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        identity: &str,
        expected: Option<RateBucket>,
        new: RateBucket,
    ) -> bool;

    /// Drop every bucket for which `keep` returns `false`. Returns how many were removed.
    fn retain<F>(&self, keep: F) -> usize
    where
        F: FnMut(&str, &RateBucket) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local bucket map behind a single mutex.
///
/// `Clone` shares the same map, so one store can back the limiter and be
/// inspected from tests at the same time.
#[derive(Clone, Debug, Default)]
pub struct MemoryBucketStore {
    inner: Arc<Mutex<HashMap<String, RateBucket>>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, RateBucket>> {
        // A panic while holding the lock cannot leave a bucket half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BucketStore for MemoryBucketStore {
    fn get(&self, identity: &str) -> Option<RateBucket> {
        self.buckets().get(identity).copied()
    }

    fn compare_and_swap(
        &self,
        identity: &str,
        expected: Option<RateBucket>,
        new: RateBucket,
    ) -> bool {
        let mut buckets = self.buckets();
        if buckets.get(identity).copied() != expected {
            return false;
        }
        buckets.insert(identity.to_string(), new);
        true
    }

    fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &RateBucket) -> bool,
    {
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|identity, bucket| keep(identity, bucket));
        before - buckets.len()
    }

    fn len(&self) -> usize {
        self.buckets().len()
    }
}
