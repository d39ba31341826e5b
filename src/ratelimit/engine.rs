//! Core rate limiter engine.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::bucket::{Bucket, BucketAlgorithm, BucketParams, BucketState, BucketStep};
use super::clock::{Clock, SystemClock};
use super::key::{derive_key, BucketKey, Identity};
use super::matcher::PolicyCatalog;
use super::policy::{Algorithm, Policy};
use super::store::{InMemoryStore, StateStore};
use crate::error::{Result, TollgateError};

/// Default wait reported when a request is refused without a bucket to consult.
const DEFAULT_CLOSED_RETRY_AFTER_SECS: u64 = 60;

/// What to do when a decision cannot be made from a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Let the request through
    #[default]
    Open,
    /// Refuse the request
    Closed,
}

/// Engine behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Handling of requests that match no policy
    pub unmatched: FailMode,
    /// `retry_after` reported when a request is refused by a fail-closed switch
    pub closed_retry_after_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            unmatched: FailMode::Open,
            closed_retry_after_secs: DEFAULT_CLOSED_RETRY_AFTER_SECS,
        }
    }
}

/// The admission decision for one consume call.
///
/// `retry_after` is present exactly when `allowed` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeDecision {
    pub allowed: bool,
    /// Capacity left; infinite when no policy applied
    pub remaining: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Name of the policy that decided, if any
    pub policy: Option<String>,
    /// Parameters of that policy at the time it decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<BucketParams>,
    /// Caller key the decision was charged to
    pub key: String,
}

/// Read-only view of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub key: String,
    pub algorithm: Algorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    /// Time of the last persisted transition; absent for an unused bucket
    pub last_update: Option<f64>,
    /// Capacity available right now
    pub remaining: f64,
}

/// Admission-control engine.
///
/// Composes the policy catalog, the bucket algorithms and the state store.
/// Create one per process and share it by `Arc`; it is safe to call from any
/// number of tasks at once.
pub struct RateLimiterEngine {
    /// Current policy set, swapped whole on reload
    policies: RwLock<Arc<PolicyCatalog>>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
}

impl RateLimiterEngine {
    /// Create an engine with an in-memory store and the system clock.
    pub fn new(catalog: PolicyCatalog) -> Self {
        Self::with_parts(catalog, Arc::new(InMemoryStore::new()), Arc::new(SystemClock))
    }

    /// Create an engine from explicit collaborators.
    pub fn with_parts(
        catalog: PolicyCatalog,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies: RwLock::new(Arc::new(catalog)),
            store,
            clock,
            options: EngineOptions::default(),
        }
    }

    /// Replace the behavior switches.
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The current policy set.
    pub fn policies(&self) -> Arc<PolicyCatalog> {
        self.policies.read().clone()
    }

    /// Look up a loaded policy by name.
    pub fn policy(&self, name: &str) -> Result<Arc<Policy>> {
        self.policies()
            .get(name)
            .cloned()
            .ok_or_else(|| TollgateError::UnknownPolicy(name.to_string()))
    }

    /// Atomically replace the policy set.
    ///
    /// Calls already in flight finish against the set they started with.
    pub fn reload(&self, catalog: PolicyCatalog) {
        let count = catalog.len();
        *self.policies.write() = Arc::new(catalog);
        info!(policies = count, "Policy set replaced");
    }

    /// Admit or refuse a request.
    ///
    /// Matches the first applicable policy, derives the caller key from the
    /// policy's scope and charges `cost` (the policy's default when `None`).
    pub async fn consume(
        &self,
        method: &str,
        path: &str,
        identity: &Identity,
        cost: Option<u32>,
    ) -> Result<ConsumeDecision> {
        let catalog = self.policies();
        let Some(policy) = catalog.find_match(method, path) else {
            trace!(method = %method, path = %path, "No policy matched");
            return Ok(self.unmatched());
        };

        let key = derive_key(policy, identity)?;
        self.consume_key(&key, policy, cost).await
    }

    /// Charge an explicit caller key against a policy.
    pub async fn consume_key(
        &self,
        key: &str,
        policy: &Policy,
        cost: Option<u32>,
    ) -> Result<ConsumeDecision> {
        let cost = cost.unwrap_or_else(|| policy.cost());
        if cost == 0 || cost > policy.burst() {
            return Err(TollgateError::InvalidCost {
                policy: policy.name().to_string(),
                cost,
                burst: policy.burst(),
            });
        }

        let bucket_key = BucketKey::for_policy(policy, key);
        let step = BucketStep {
            algorithm: policy.algorithm(),
            params: policy.params(),
            cost,
            now: self.clock.now(),
        };

        trace!(key = %bucket_key, cost, "Consuming");
        let outcome = self.store.update(bucket_key.as_str(), &step).await?;
        let verdict = outcome.verdict;

        if !verdict.allowed {
            debug!(
                key = %bucket_key,
                policy = %policy.name(),
                retry_after = ?verdict.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(ConsumeDecision {
            allowed: verdict.allowed,
            remaining: verdict.remaining,
            retry_after: verdict.retry_after,
            policy: Some(policy.name().to_string()),
            limit: Some(policy.params()),
            key: key.to_string(),
        })
    }

    /// Project a bucket's current capacity without changing it.
    pub async fn snapshot(&self, key: &str, policy: &Policy) -> Result<QuotaSnapshot> {
        let bucket = Bucket::new(policy.algorithm(), policy.params());
        let stored = self
            .store
            .get(BucketKey::for_policy(policy, key).as_str())
            .await?
            .filter(|state| state.algorithm() == policy.algorithm());

        let projected = bucket.project(stored, self.clock.now());
        let (tokens, level) = match projected {
            BucketState::TokenBucket { tokens, .. } => (Some(tokens), None),
            BucketState::LeakyBucket { level, .. } => (None, Some(level)),
        };

        Ok(QuotaSnapshot {
            key: key.to_string(),
            algorithm: policy.algorithm(),
            tokens,
            level,
            last_update: stored.map(|state| state.last_update()),
            remaining: bucket.remaining(&projected),
        })
    }

    /// Forget a caller's bucket; the next consume starts from scratch.
    pub async fn reset(&self, key: &str, policy: &Policy) -> Result<()> {
        let bucket_key = BucketKey::for_policy(policy, key);
        self.store.remove(bucket_key.as_str()).await?;
        debug!(key = %bucket_key, "Bucket reset");
        Ok(())
    }

    fn unmatched(&self) -> ConsumeDecision {
        match self.options.unmatched {
            FailMode::Open => ConsumeDecision {
                allowed: true,
                remaining: f64::INFINITY,
                retry_after: None,
                policy: None,
                limit: None,
                key: String::new(),
            },
            FailMode::Closed => ConsumeDecision {
                allowed: false,
                remaining: 0.0,
                retry_after: Some(self.options.closed_retry_after_secs),
                policy: None,
                limit: None,
                key: String::new(),
            },
        }
    }
}
