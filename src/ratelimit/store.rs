//! Atomic bucket state storage.
//!
//! [`StateStore`] is the only path through which bucket state is read or
//! mutated. The engine never reads a state, decides, and writes it back; it
//! hands the whole transition to [`StateStore::update`] as a [`BucketStep`].
//!
//! # Contract for implementations
//!
//! - `update` is linearizable per key: for concurrent calls on one key, the
//!   resulting states match some serial order of those calls.
//! - Calls on different keys must not serialize behind a single global lock.
//! - Every call completes in bounded time.
//! - Failure to complete is reported as [`StoreError::Unavailable`]; a store
//!   must never guess a state on the caller's behalf.
//!
//! A distributed store satisfies this by running [`BucketStep::apply`] on the
//! server, for example as a script executed atomically per key.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::bucket::{BucketState, BucketStep, StepOutcome};

/// How many entries are inspected when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 32;

/// Eviction attempts per insert before giving up.
const EVICTION_ROUNDS: usize = 16;

/// Errors reported by a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not complete the operation
    #[error("{0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Atomic key -> bucket state storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current state of a key.
    async fn get(&self, key: &str) -> StoreResult<Option<BucketState>>;

    /// Overwrite the state of a key.
    async fn set(&self, key: &str, state: BucketState) -> StoreResult<()>;

    /// Atomically apply `step` to the state of `key` and persist the result.
    async fn update(&self, key: &str, step: &BucketStep) -> StoreResult<StepOutcome>;

    /// Forget a key entirely.
    async fn remove(&self, key: &str) -> StoreResult<()>;
}

/// In-process store backed by a sharded concurrent map.
///
/// Each shard has its own lock, held for the duration of one read-modify-write,
/// so keys in different shards never block each other.
pub struct InMemoryStore {
    entries: DashMap<String, BucketState>,
    max_entries: Option<usize>,
}

impl InMemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: None,
        }
    }

    /// Create a store that evicts old entries beyond `max_entries`.
    ///
    /// The limit is approximate: the capacity check runs before the entry
    /// lock is taken, so concurrent inserts of new keys can briefly exceed
    /// it by up to the number of racing writers.
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    /// Number of stored buckets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every bucket.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Make room for `incoming` if the store is at capacity.
    ///
    /// Must be called without holding any shard lock. Not atomic with the
    /// insert that follows, so the bound is best-effort under contention.
    fn make_room(&self, incoming: &str) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.entries.contains_key(incoming) {
            return;
        }

        for _ in 0..EVICTION_ROUNDS {
            if self.entries.len() < max {
                return;
            }

            let Some((key, last_update)) = self
                .entries
                .iter()
                .take(EVICTION_SAMPLE)
                .map(|entry| (entry.key().clone(), entry.value().last_update()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
            else {
                return;
            };

            // The entry may have been touched since it was sampled; only evict
            // it if it is still as old as observed.
            let evicted = self
                .entries
                .remove_if(&key, |_, state| state.last_update() <= last_update)
                .is_some();
            if evicted {
                debug!(key = %key, last_update, "Evicted bucket at capacity");
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<BucketState>> {
        Ok(self.entries.get(key).map(|state| *state))
    }

    async fn set(&self, key: &str, state: BucketState) -> StoreResult<()> {
        self.make_room(key);
        self.entries.insert(key.to_string(), state);
        Ok(())
    }

    async fn update(&self, key: &str, step: &BucketStep) -> StoreResult<StepOutcome> {
        self.make_room(key);

        // The entry guard holds the shard's write lock until it is dropped.
        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let outcome = step.apply(Some(*occupied.get()));
                *occupied.get_mut() = outcome.state;
                outcome
            }
            Entry::Vacant(vacant) => {
                let outcome = step.apply(None);
                debug!(key = %key, algorithm = %step.algorithm, "Creating bucket");
                vacant.insert(outcome.state);
                outcome
            }
        };

        trace!(
            key = %key,
            cost = step.cost,
            allowed = outcome.verdict.allowed,
            remaining = outcome.verdict.remaining,
            "Applied bucket step"
        );
        Ok(outcome)
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::BucketParams;
    use crate::ratelimit::Algorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn step(burst: u32, now: f64) -> BucketStep {
        BucketStep {
            algorithm: Algorithm::TokenBucket,
            params: BucketParams {
                rate: 1,
                period: 1,
                burst,
            },
            cost: 1,
            now,
        }
    }

    #[tokio::test]
    async fn test_update_creates_then_mutates() {
        let store = InMemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        let first = store.update("k", &step(3, 0.0)).await.unwrap();
        assert!(first.verdict.allowed);
        assert_eq!(store.len(), 1);

        let second = store.update("k", &step(3, 0.0)).await.unwrap();
        assert_eq!(second.verdict.remaining, 1.0);
        assert_eq!(store.get("k").await.unwrap(), Some(second.state));
    }

    #[tokio::test]
    async fn test_set_and_remove() {
        let store = InMemoryStore::new();
        let state = BucketState::LeakyBucket {
            level: 1.5,
            last_update: 4.0,
        };
        store.set("k", state).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(state));

        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());

        // Removing an absent key is not an error.
        store.remove("k").await.unwrap();
    }

    #[test]
    fn test_update_is_linearizable_across_threads() {
        const THREADS: usize = 8;
        const CALLS: usize = 50;
        const BURST: usize = 100;

        let store = Arc::new(InMemoryStore::new());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = store.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..CALLS {
                        let outcome =
                            futures::executor::block_on(store.update("shared", &step(BURST as u32, 0.0)))
                                .unwrap();
                        if outcome.verdict.allowed {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), BURST);
        let state = tokio_test::block_on(store.get("shared")).unwrap().unwrap();
        assert_eq!(
            state,
            BucketState::TokenBucket {
                tokens: 0.0,
                last_update: 0.0
            }
        );
    }

    #[tokio::test]
    async fn test_capacity_limit_evicts_oldest() {
        let store = InMemoryStore::with_capacity_limit(2);
        store.update("old", &step(1, 1.0)).await.unwrap();
        store.update("new", &step(1, 5.0)).await.unwrap();
        store.update("newest", &step(1, 9.0)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("new").await.unwrap().is_some());
        assert!(store.get("newest").await.unwrap().is_some());
    }

    #[test]
    fn test_capacity_limit_under_concurrent_inserts() {
        const THREADS: usize = 8;
        const KEYS: usize = 200;
        const MAX: usize = 16;

        let store = Arc::new(InMemoryStore::with_capacity_limit(MAX));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..KEYS {
                        let key = format!("t{}-{}", t, i);
                        futures::executor::block_on(store.update(&key, &step(1, i as f64))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Overshoot is bounded by the writers racing at the end, never cumulative.
        assert!(store.len() <= MAX + THREADS, "len {}", store.len());

        tokio_test::block_on(store.update("after", &step(1, 1e6))).unwrap();
        assert!(store.len() <= MAX, "len {}", store.len());
    }

    #[tokio::test]
    async fn test_capacity_limit_ignores_existing_keys() {
        let store = InMemoryStore::with_capacity_limit(1);
        store.update("only", &step(5, 1.0)).await.unwrap();
        store.update("only", &step(5, 2.0)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("only").await.unwrap().is_some());
    }
}
