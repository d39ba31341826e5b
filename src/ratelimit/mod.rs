//! Rate limiting logic and state management.

mod admission;
mod bucket;
mod clock;
mod engine;
mod key;
mod matcher;
mod policy;
mod reload;
mod store;

pub use admission::{
    default_skip_paths, AdmissionController, AdmissionOutcome, AdmissionRequest, RejectionBody,
    HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER, STATUS_TOO_MANY_REQUESTS,
};
pub use bucket::{
    Bucket, BucketAlgorithm, BucketParams, BucketState, BucketStep, LeakyBucket, StepOutcome,
    TokenBucket, Verdict,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ConsumeDecision, EngineOptions, FailMode, QuotaSnapshot, RateLimiterEngine};
pub use key::{derive_key, BucketKey, Identity};
pub use matcher::PolicyCatalog;
pub use policy::{Algorithm, Methods, MethodsDefinition, Policy, PolicyDefinition, Scope};
pub use reload::{reload_from_file, spawn_policy_reloader};
pub use store::{InMemoryStore, StateStore, StoreError, StoreResult};
