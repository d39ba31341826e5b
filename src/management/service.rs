//! Management operations against a shared engine.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::protocol::{ManagementRequest, ManagementResponse, PolicyRef};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{AdmissionController, AdmissionRequest, Policy, RateLimiterEngine};

/// Executes management requests.
pub struct ManagementService {
    admission: AdmissionController,
}

impl ManagementService {
    /// Create a service over an admission controller and its engine.
    pub fn new(admission: AdmissionController) -> Self {
        Self { admission }
    }

    fn engine(&self) -> &Arc<RateLimiterEngine> {
        self.admission.engine()
    }

    /// Handle one request. Failures are reported in the response.
    #[instrument(skip(self, request), fields(op = request.op()))]
    pub async fn handle(&self, request: ManagementRequest) -> ManagementResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Management request failed");
                e.into()
            }
        }
    }

    /// Handle one line of the wire protocol and render the response line.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ManagementRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "Malformed management request");
                TollgateError::Json(e).into()
            }
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                r#"{{"error":"internal_error","message":"failed to encode response: {}"}}"#,
                e
            )
        })
    }

    async fn dispatch(&self, request: ManagementRequest) -> Result<ManagementResponse> {
        let engine = self.engine();
        match request {
            ManagementRequest::Consume { key, policy, cost } => {
                let policy = self.resolve(&policy)?;
                let decision = engine.consume_key(&key, &policy, cost).await?;
                Ok(ManagementResponse::Decision(decision))
            }
            ManagementRequest::Quota { key, policy } => {
                let policy = self.resolve(&policy)?;
                Ok(ManagementResponse::Quota(engine.snapshot(&key, &policy).await?))
            }
            ManagementRequest::Reset { key, policy } => {
                let policy = self.resolve(&policy)?;
                engine.reset(&key, &policy).await?;
                Ok(ManagementResponse::Ack { ok: true })
            }
            ManagementRequest::Admit {
                method,
                path,
                identity,
                cost,
            } => {
                let outcome = self
                    .admission
                    .evaluate(&AdmissionRequest {
                        method: &method,
                        path: &path,
                        identity: &identity,
                        cost,
                    })
                    .await?;
                Ok(ManagementResponse::Admission(outcome))
            }
            ManagementRequest::Policies => Ok(ManagementResponse::Policies {
                policies: engine.policies().iter().map(|p| p.to_definition()).collect(),
            }),
        }
    }

    fn resolve(&self, policy: &PolicyRef) -> Result<Arc<Policy>> {
        match policy {
            PolicyRef::Name(name) => self.engine().policy(name),
            PolicyRef::Inline(definition) => Ok(Arc::new(definition.compile()?)),
        }
    }
}
