//! Reference interception boundary.
//!
//! [`AdmissionController`] is what a request pipeline calls per request: it
//! bypasses health and metrics endpoints, asks the engine for a decision,
//! applies the store-failure fallback and renders the response metadata.
//! Transport is left to the caller; outcomes carry plain header pairs and a
//! JSON body.

use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use super::engine::{ConsumeDecision, FailMode, RateLimiterEngine};
use super::key::Identity;
use crate::error::{Result, TollgateError};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Status code of a rejection.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Paths that bypass rate limiting unless configured otherwise.
pub fn default_skip_paths() -> Vec<String> {
    vec!["^/healthz$".to_string(), "^/metrics$".to_string()]
}

/// One inbound request, as seen by the boundary.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub identity: &'a Identity,
    /// Overrides the matched policy's default cost
    pub cost: Option<u32>,
}

/// Body of a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub retry_after: u64,
}

/// What the pipeline should do with a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    /// The path is exempt; no decision was made.
    Bypassed,
    /// Forward the request and attach `headers` to the response.
    Admitted { headers: Vec<(String, String)> },
    /// Answer with `status`, `headers` and `body` instead of forwarding.
    Rejected {
        status: u16,
        retry_after: u64,
        headers: Vec<(String, String)>,
        body: RejectionBody,
    },
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, AdmissionOutcome::Rejected { .. })
    }
}

/// Per-request admission on top of a shared engine.
pub struct AdmissionController {
    engine: Arc<RateLimiterEngine>,
    skip_paths: Vec<Regex>,
    store_failure: FailMode,
}

impl AdmissionController {
    /// Create a controller.
    ///
    /// `skip_paths` are regular expressions; `store_failure` decides what
    /// happens when the state store cannot be reached.
    pub fn new(
        engine: Arc<RateLimiterEngine>,
        skip_paths: &[String],
        store_failure: FailMode,
    ) -> Result<Self> {
        let skip_paths = skip_paths
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    TollgateError::Config(format!("invalid skip path '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            engine,
            skip_paths,
            store_failure,
        })
    }

    pub fn engine(&self) -> &Arc<RateLimiterEngine> {
        &self.engine
    }

    /// Decide what to do with a request.
    ///
    /// Store outages are resolved by the configured fallback. Every other
    /// engine error (missing identity, bad cost) is returned to the caller.
    pub async fn evaluate(&self, request: &AdmissionRequest<'_>) -> Result<AdmissionOutcome> {
        if self.skip_paths.iter().any(|re| re.is_match(request.path)) {
            return Ok(AdmissionOutcome::Bypassed);
        }

        let decision = match self
            .engine
            .consume(request.method, request.path, request.identity, request.cost)
            .await
        {
            Ok(decision) => decision,
            Err(TollgateError::StoreUnavailable(e)) => {
                return Ok(self.store_unavailable(request, &e.to_string()));
            }
            Err(e) => return Err(e),
        };

        Ok(self.render(&decision))
    }

    fn store_unavailable(&self, request: &AdmissionRequest<'_>, error: &str) -> AdmissionOutcome {
        match self.store_failure {
            FailMode::Open => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %error,
                    "State store unavailable, admitting request"
                );
                AdmissionOutcome::Admitted { headers: Vec::new() }
            }
            FailMode::Closed => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %error,
                    "State store unavailable, rejecting request"
                );
                let retry_after = self.engine.options().closed_retry_after_secs;
                rejection(retry_after, Vec::new())
            }
        }
    }

    fn render(&self, decision: &ConsumeDecision) -> AdmissionOutcome {
        let mut headers = Vec::new();
        if let Some(limit) = &decision.limit {
            headers.push((
                HEADER_LIMIT.to_string(),
                format!("{};w={};burst={}", limit.rate, limit.period, limit.burst),
            ));
            headers.push((
                HEADER_REMAINING.to_string(),
                (decision.remaining.max(0.0).floor() as u64).to_string(),
            ));
        }

        match decision.retry_after {
            None => {
                if let Some(limit) = &decision.limit {
                    // Best-effort hint, not an exact window boundary.
                    headers.push((HEADER_RESET.to_string(), limit.period.to_string()));
                }
                AdmissionOutcome::Admitted { headers }
            }
            Some(retry_after) => {
                headers.push((HEADER_RESET.to_string(), retry_after.to_string()));
                rejection(retry_after, headers)
            }
        }
    }
}

fn rejection(retry_after: u64, mut headers: Vec<(String, String)>) -> AdmissionOutcome {
    headers.push((HEADER_RETRY_AFTER.to_string(), retry_after.to_string()));
    AdmissionOutcome::Rejected {
        status: STATUS_TOO_MANY_REQUESTS,
        retry_after,
        headers,
        body: RejectionBody {
            error: "rate_limited",
            retry_after,
        },
    }
}
