//! Wire format of the management surface: one JSON object per line.

use serde::{Deserialize, Serialize};

use crate::error::TollgateError;
use crate::ratelimit::{AdmissionOutcome, ConsumeDecision, Identity, PolicyDefinition, QuotaSnapshot};

/// A policy named from the loaded set, or spelled out inline.
///
/// Inline policies share buckets with loaded policies of the same name and
/// algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyRef {
    Name(String),
    Inline(PolicyDefinition),
}

/// A management request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ManagementRequest {
    /// Charge a caller key against a policy
    Consume {
        key: String,
        policy: PolicyRef,
        #[serde(default)]
        cost: Option<u32>,
    },
    /// Read a bucket without changing it
    Quota { key: String, policy: PolicyRef },
    /// Forget a bucket
    Reset { key: String, policy: PolicyRef },
    /// Run a request through the interception boundary
    Admit {
        method: String,
        path: String,
        #[serde(default)]
        identity: Identity,
        #[serde(default)]
        cost: Option<u32>,
    },
    /// List the loaded policies
    Policies,
}

impl ManagementRequest {
    /// Operation name, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            ManagementRequest::Consume { .. } => "consume",
            ManagementRequest::Quota { .. } => "quota",
            ManagementRequest::Reset { .. } => "reset",
            ManagementRequest::Admit { .. } => "admit",
            ManagementRequest::Policies => "policies",
        }
    }
}

/// A management response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ManagementResponse {
    Decision(ConsumeDecision),
    Quota(QuotaSnapshot),
    Ack { ok: bool },
    Admission(AdmissionOutcome),
    Policies { policies: Vec<PolicyDefinition> },
    Error { error: String, message: String },
}

impl From<TollgateError> for ManagementResponse {
    fn from(e: TollgateError) -> Self {
        ManagementResponse::Error {
            error: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}
