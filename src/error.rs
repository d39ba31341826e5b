//! Error types for the Tollgate engine.

use thiserror::Error;

use crate::ratelimit::{Scope, StoreError};

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Malformed policy set or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The matched policy is scoped to an identity the caller did not supply
    #[error("Policy '{policy}' is scoped by {scope}, but no {scope} identity was supplied")]
    UnsupportedScope { policy: String, scope: Scope },

    /// The state store could not complete the atomic update
    #[error("State store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A cost that the policy could never admit
    #[error("Invalid cost {cost} for policy '{policy}' (burst {burst})")]
    InvalidCost { policy: String, cost: u32, burst: u32 },

    /// A policy name that is not part of the loaded policy set
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TollgateError {
    /// Short machine-readable name for this error, used on the management surface.
    pub fn kind(&self) -> &'static str {
        match self {
            TollgateError::Config(_) => "configuration_error",
            TollgateError::UnsupportedScope { .. } => "unsupported_scope",
            TollgateError::StoreUnavailable(_) => "store_unavailable",
            TollgateError::InvalidCost { .. } => "invalid_cost",
            TollgateError::UnknownPolicy(_) => "unknown_policy",
            TollgateError::Io(_) => "io_error",
            TollgateError::Json(_) => "invalid_request",
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
