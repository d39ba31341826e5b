//! Token-bucket and leaky-bucket state machines.
//!
//! Both algorithms are pure functions of `(previous state, cost, now)`. They
//! never read a clock and never touch shared state; the store applies them
//! inside its atomic update.

use serde::{Deserialize, Serialize};

use super::policy::Algorithm;

/// Tolerance, in permits, applied when comparing capacity against a cost.
///
/// Keeps float rounding from denying a request that exact arithmetic admits.
const EPSILON: f64 = 1e-9;

/// Throughput parameters of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Permits per period
    pub rate: u32,
    /// Period length in seconds
    pub period: u32,
    /// Capacity
    pub burst: u32,
}

impl BucketParams {
    /// Permits gained (token bucket) or drained (leaky bucket) over `elapsed` seconds.
    fn over(&self, elapsed: f64) -> f64 {
        elapsed * f64::from(self.rate) / f64::from(self.period)
    }

    /// Seconds needed to gain or drain `permits`, rounded up.
    ///
    /// Half the admission tolerance is taken off first so float noise just
    /// above a whole second does not cost the caller an extra second, while
    /// the wait still clears the admission check with margin.
    fn seconds_for(&self, permits: f64) -> u64 {
        let permits = (permits - EPSILON / 2.0).max(0.0);
        (permits * f64::from(self.period) / f64::from(self.rate)).ceil() as u64
    }

    fn capacity(&self) -> f64 {
        f64::from(self.burst)
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum BucketState {
    TokenBucket { tokens: f64, last_update: f64 },
    LeakyBucket { level: f64, last_update: f64 },
}

impl BucketState {
    /// Time of the last persisted transition.
    pub fn last_update(&self) -> f64 {
        match self {
            BucketState::TokenBucket { last_update, .. } => *last_update,
            BucketState::LeakyBucket { last_update, .. } => *last_update,
        }
    }

    /// The algorithm this state belongs to.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            BucketState::TokenBucket { .. } => Algorithm::TokenBucket,
            BucketState::LeakyBucket { .. } => Algorithm::LeakyBucket,
        }
    }
}

/// The admission result of a single transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    /// Capacity left after the transition
    pub remaining: f64,
    /// Whole seconds to wait before retrying; set only on denial
    pub retry_after: Option<u64>,
}

/// A bucket algorithm: how state is created, aged and charged.
///
/// Implementations must be deterministic in their inputs so that any store,
/// local or remote, produces the same sequence of states for the same
/// sequence of steps.
pub trait BucketAlgorithm {
    /// Which algorithm this is.
    fn algorithm(&self) -> Algorithm;

    /// State of a bucket that has never been used, at `now`.
    fn initial(&self, now: f64) -> BucketState;

    /// State aged to `now` without charging anything.
    ///
    /// A state of the wrong shape is treated as absent.
    fn project(&self, state: Option<BucketState>, now: f64) -> BucketState;

    /// Capacity available in an (already projected) state.
    fn remaining(&self, state: &BucketState) -> f64;

    /// Age the state to `now` and try to charge `cost`.
    ///
    /// The returned state is persisted whether or not the charge succeeded.
    fn admit(&self, state: Option<BucketState>, cost: u32, now: f64) -> (BucketState, Verdict);
}

/// Pool of permits refilled at `rate / period` per second, capped at `burst`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    params: BucketParams,
}

impl TokenBucket {
    pub fn new(params: BucketParams) -> Self {
        Self { params }
    }
}

impl BucketAlgorithm for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn initial(&self, now: f64) -> BucketState {
        BucketState::TokenBucket {
            tokens: self.params.capacity(),
            last_update: now,
        }
    }

    fn project(&self, state: Option<BucketState>, now: f64) -> BucketState {
        match state {
            Some(BucketState::TokenBucket { tokens, last_update }) => {
                let elapsed = (now - last_update).max(0.0);
                BucketState::TokenBucket {
                    tokens: (tokens + self.params.over(elapsed)).min(self.params.capacity()),
                    last_update: now,
                }
            }
            _ => self.initial(now),
        }
    }

    fn remaining(&self, state: &BucketState) -> f64 {
        match state {
            BucketState::TokenBucket { tokens, .. } => tokens.max(0.0),
            BucketState::LeakyBucket { .. } => 0.0,
        }
    }

    fn admit(&self, state: Option<BucketState>, cost: u32, now: f64) -> (BucketState, Verdict) {
        let mut tokens = match self.project(state, now) {
            BucketState::TokenBucket { tokens, .. } => tokens,
            BucketState::LeakyBucket { .. } => self.params.capacity(),
        };
        let cost = f64::from(cost);

        let verdict = if tokens + EPSILON >= cost {
            tokens = (tokens - cost).max(0.0);
            Verdict {
                allowed: true,
                remaining: tokens,
                retry_after: None,
            }
        } else {
            Verdict {
                allowed: false,
                remaining: tokens,
                retry_after: Some(self.params.seconds_for(cost - tokens)),
            }
        };

        (
            BucketState::TokenBucket {
                tokens,
                last_update: now,
            },
            verdict,
        )
    }
}

/// Level drained at `rate / period` per second; requests add their cost.
#[derive(Debug, Clone, Copy)]
pub struct LeakyBucket {
    params: BucketParams,
}

impl LeakyBucket {
    pub fn new(params: BucketParams) -> Self {
        Self { params }
    }
}

impl BucketAlgorithm for LeakyBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn initial(&self, now: f64) -> BucketState {
        BucketState::LeakyBucket {
            level: 0.0,
            last_update: now,
        }
    }

    fn project(&self, state: Option<BucketState>, now: f64) -> BucketState {
        match state {
            Some(BucketState::LeakyBucket { level, last_update }) => {
                let elapsed = (now - last_update).max(0.0);
                BucketState::LeakyBucket {
                    level: (level - self.params.over(elapsed)).max(0.0),
                    last_update: now,
                }
            }
            _ => self.initial(now),
        }
    }

    fn remaining(&self, state: &BucketState) -> f64 {
        match state {
            BucketState::LeakyBucket { level, .. } => (self.params.capacity() - level).max(0.0),
            BucketState::TokenBucket { .. } => 0.0,
        }
    }

    fn admit(&self, state: Option<BucketState>, cost: u32, now: f64) -> (BucketState, Verdict) {
        let mut level = match self.project(state, now) {
            BucketState::LeakyBucket { level, .. } => level,
            BucketState::TokenBucket { .. } => 0.0,
        };
        let burst = self.params.capacity();
        let cost = f64::from(cost);

        let verdict = if level + cost <= burst + EPSILON {
            level = (level + cost).min(burst);
            Verdict {
                allowed: true,
                remaining: (burst - level).max(0.0),
                retry_after: None,
            }
        } else {
            let target = burst - cost;
            let retry_after = if level <= target {
                0
            } else {
                self.params.seconds_for(level - target)
            };
            Verdict {
                allowed: false,
                remaining: (burst - level).max(0.0),
                retry_after: Some(retry_after),
            }
        };

        (
            BucketState::LeakyBucket {
                level,
                last_update: now,
            },
            verdict,
        )
    }
}

/// Either algorithm, selected by a policy.
#[derive(Debug, Clone, Copy)]
pub enum Bucket {
    Token(TokenBucket),
    Leaky(LeakyBucket),
}

impl Bucket {
    pub fn new(algorithm: Algorithm, params: BucketParams) -> Self {
        match algorithm {
            Algorithm::TokenBucket => Bucket::Token(TokenBucket::new(params)),
            Algorithm::LeakyBucket => Bucket::Leaky(LeakyBucket::new(params)),
        }
    }

    fn inner(&self) -> &dyn BucketAlgorithm {
        match self {
            Bucket::Token(b) => b,
            Bucket::Leaky(b) => b,
        }
    }
}

impl BucketAlgorithm for Bucket {
    fn algorithm(&self) -> Algorithm {
        self.inner().algorithm()
    }

    fn initial(&self, now: f64) -> BucketState {
        self.inner().initial(now)
    }

    fn project(&self, state: Option<BucketState>, now: f64) -> BucketState {
        self.inner().project(state, now)
    }

    fn remaining(&self, state: &BucketState) -> f64 {
        self.inner().remaining(state)
    }

    fn admit(&self, state: Option<BucketState>, cost: u32, now: f64) -> (BucketState, Verdict) {
        self.inner().admit(state, cost, now)
    }
}

/// A self-contained transition: everything needed to advance one bucket.
///
/// This is the unit of work handed to a [`StateStore`](super::StateStore). It
/// is plain data so that a remote store can ship it to the server and run the
/// same arithmetic there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketStep {
    pub algorithm: Algorithm,
    pub params: BucketParams,
    pub cost: u32,
    pub now: f64,
}

/// The persisted state and admission verdict of one applied step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub state: BucketState,
    pub verdict: Verdict,
}

impl BucketStep {
    /// Apply this step to the current stored state.
    pub fn apply(&self, current: Option<BucketState>) -> StepOutcome {
        let (state, verdict) = Bucket::new(self.algorithm, self.params).admit(current, self.cost, self.now);
        StepOutcome { state, verdict }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(rate: u32, period: u32, burst: u32) -> BucketParams {
        BucketParams { rate, period, burst }
    }

    /// Drive a bucket through a sequence of `(now, cost)` calls.
    fn run(bucket: &dyn BucketAlgorithm, calls: &[(f64, u32)]) -> Vec<Verdict> {
        let mut state = None;
        calls
            .iter()
            .map(|&(now, cost)| {
                let (next, verdict) = bucket.admit(state, cost, now);
                state = Some(next);
                verdict
            })
            .collect()
    }

    #[test]
    fn test_token_bucket_worked_example() {
        let bucket = TokenBucket::new(params(2, 1, 2));
        let v = run(&bucket, &[(0.0, 1), (0.0, 1), (0.0, 1), (1.0, 1)]);

        assert!(v[0].allowed);
        assert_eq!(v[0].remaining, 1.0);
        assert!(v[1].allowed);
        assert_eq!(v[1].remaining, 0.0);
        assert!(!v[2].allowed);
        assert_eq!(v[2].retry_after, Some(1));
        assert!(v[3].allowed);
        assert_eq!(v[3].remaining, 1.0);
    }

    #[test]
    fn test_token_bucket_partial_refill_still_denied() {
        let bucket = TokenBucket::new(params(2, 1, 2));
        let v = run(&bucket, &[(0.0, 2), (0.0, 1), (0.25, 1), (0.5, 1)]);

        assert!(v[0].allowed);
        assert!(!v[1].allowed);
        // 0.5 tokens after 0.25s, 0.5 more needed at 2/s
        assert!(!v[2].allowed);
        assert_eq!(v[2].retry_after, Some(1));
        assert!(v[3].allowed);
    }

    #[test]
    fn test_token_bucket_refill_capped_at_burst() {
        let bucket = TokenBucket::new(params(10, 1, 3));
        let v = run(&bucket, &[(0.0, 3), (1000.0, 1)]);
        assert_eq!(v[1].remaining, 2.0);
    }

    #[test]
    fn test_token_bucket_period_refills_rate() {
        let bucket = TokenBucket::new(params(3, 60, 10));
        let v = run(&bucket, &[(0.0, 10), (60.0, 1)]);
        assert!(v[1].allowed);
        assert!((v[1].remaining - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_leaky_bucket_worked_example() {
        let bucket = LeakyBucket::new(params(2, 1, 2));
        let v = run(&bucket, &[(0.0, 1), (0.0, 1), (0.0, 1), (1.0, 1)]);

        assert!(v[0].allowed);
        assert_eq!(v[0].remaining, 1.0);
        assert!(v[1].allowed);
        assert_eq!(v[1].remaining, 0.0);
        assert!(!v[2].allowed);
        assert_eq!(v[2].retry_after, Some(1));
        assert!(v[3].allowed);
    }

    #[test]
    fn test_leaky_bucket_starts_empty() {
        let bucket = LeakyBucket::new(params(1, 1, 5));
        assert_eq!(
            bucket.initial(7.0),
            BucketState::LeakyBucket {
                level: 0.0,
                last_update: 7.0
            }
        );
        assert_eq!(bucket.remaining(&bucket.initial(7.0)), 5.0);
    }

    #[test]
    fn test_retry_after_is_sufficient() {
        let shapes = [
            params(1, 1, 1),
            params(3, 1, 5),
            params(1, 10, 2),
            params(7, 3, 7),
            params(2, 5, 5),
            params(2, 7, 3),
            params(11, 6, 4),
        ];
        let steps = [0.1, 0.25, 0.3, 0.7, 1.3];

        for algorithm in [Algorithm::TokenBucket, Algorithm::LeakyBucket] {
            for p in shapes {
                for cost in 1..=p.burst {
                    for step in steps {
                        let bucket = Bucket::new(algorithm, p);
                        let mut now = 0.0;
                        let mut state = None;
                        let mut calls = 0;
                        // Drain until the first denial; the clock stops after a
                        // while so fast refills still run dry.
                        let retry = loop {
                            let (next, verdict) = bucket.admit(state, cost, now);
                            state = Some(next);
                            if let Some(retry) = verdict.retry_after {
                                break retry;
                            }
                            calls += 1;
                            if calls < 20 {
                                now += step;
                            }
                        };
                        let case = format!("{:?} {:?} cost {} step {}", algorithm, p, cost, step);
                        assert!(retry > 0, "{}", case);

                        let (_, verdict) = bucket.admit(state, cost, now + retry as f64);
                        assert!(verdict.allowed, "{} denied after waiting {}s", case, retry);

                        // And no sooner than one whole second earlier.
                        let (_, early) = bucket.admit(state, cost, now + (retry - 1) as f64);
                        assert!(!early.allowed, "{} retry_after {} over-estimated", case, retry);
                    }
                }
            }
        }
    }

    #[test]
    fn test_retry_after_ignores_float_noise_above_whole_second() {
        // 0.3s of a 2-per-5s bucket leaves a deficit of 0.88 tokens; the exact
        // wait is 2.2s, so a retry at +2s must still be refused and +3s admitted.
        let bucket = TokenBucket::new(params(2, 5, 5));
        let mut state = None;
        for _ in 0..5 {
            state = Some(bucket.admit(state, 1, 0.0).0);
        }
        let (state, verdict) = bucket.admit(state, 1, 0.3);
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Some(3));
        assert!(!bucket.admit(Some(state), 1, 2.3).1.allowed);
        assert!(bucket.admit(Some(state), 1, 3.3).1.allowed);

        let p = params(2, 5, 5);
        assert_eq!(p.seconds_for(1.0 + 1e-12), 3);
        assert_eq!(p.seconds_for(0.8 + 1e-12), 2);
        assert_eq!(p.seconds_for(0.8000001), 3);
    }

    #[test]
    fn test_backward_clock_jump_does_not_refill_or_regress() {
        let token = TokenBucket::new(params(1, 1, 2));
        let v = run(&token, &[(100.0, 2), (50.0, 1)]);
        assert!(!v[1].allowed);
        assert_eq!(v[1].remaining, 0.0);

        let leaky = LeakyBucket::new(params(1, 1, 2));
        let v = run(&leaky, &[(100.0, 2), (50.0, 1)]);
        assert!(!v[1].allowed);
        assert_eq!(v[1].remaining, 0.0);
    }

    #[test]
    fn test_denial_still_advances_last_update() {
        let bucket = TokenBucket::new(params(1, 1, 1));
        let (state, _) = bucket.admit(None, 1, 0.0);
        let (state, verdict) = bucket.admit(Some(state), 1, 0.5);
        assert!(!verdict.allowed);
        assert_eq!(state.last_update(), 0.5);
    }

    #[test]
    fn test_mismatched_state_treated_as_fresh() {
        let leaky_state = BucketState::LeakyBucket {
            level: 2.0,
            last_update: 0.0,
        };
        let (state, verdict) = TokenBucket::new(params(1, 1, 2)).admit(Some(leaky_state), 1, 0.0);
        assert!(verdict.allowed);
        assert_eq!(state.algorithm(), Algorithm::TokenBucket);
        assert_eq!(verdict.remaining, 1.0);
    }

    #[test]
    fn test_project_does_not_charge() {
        let bucket = Bucket::new(Algorithm::TokenBucket, params(1, 1, 4));
        let (state, _) = bucket.admit(None, 4, 0.0);
        let projected = bucket.project(Some(state), 2.0);
        assert_eq!(bucket.remaining(&projected), 2.0);
        assert_eq!(bucket.remaining(&bucket.project(Some(state), 2.0)), 2.0);
    }

    #[test]
    fn test_step_serializes_as_plain_data() {
        let step = BucketStep {
            algorithm: Algorithm::LeakyBucket,
            params: params(2, 1, 2),
            cost: 1,
            now: 12.5,
        };
        let json = serde_json::to_value(step).unwrap();
        assert_eq!(json["algorithm"], "leaky_bucket");
        assert_eq!(json["params"]["burst"], 2);

        let outcome = step.apply(None);
        assert!(outcome.verdict.allowed);
        assert_eq!(
            outcome.state,
            BucketState::LeakyBucket {
                level: 1.0,
                last_update: 12.5
            }
        );
    }
}
