//! Identity-to-key derivation.

use serde::{Deserialize, Serialize};

use super::policy::{Algorithm, Policy, Scope};
use crate::error::{Result, TollgateError};

/// Prefix shared by every bucket key this crate writes.
const NAMESPACE: &str = "tollgate";

/// Identity attributes supplied by the caller.
///
/// Extracting these from a request (client address, authenticated user,
/// tenant header) is the caller's job. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub custom: Option<String>,
}

impl Identity {
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_custom(mut self, custom: impl Into<String>) -> Self {
        self.custom = Some(custom.into());
        self
    }

    /// The identity component a scope is keyed by.
    fn component(&self, scope: Scope) -> Option<&str> {
        let value = match scope {
            Scope::Ip => self.ip.as_deref(),
            Scope::User => self.user.as_deref(),
            Scope::Tenant => self.tenant.as_deref(),
            Scope::Custom => self.custom.as_deref(),
            Scope::Global => return Some("*"),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// Derive the caller key for a policy, e.g. `ip:10.0.0.1` or `global:*`.
///
/// Fails with [`TollgateError::UnsupportedScope`] when the identity component
/// the policy's scope needs is missing; there is no shared fallback bucket.
pub fn derive_key(policy: &Policy, identity: &Identity) -> Result<String> {
    let scope = policy.scope();
    let component = identity
        .component(scope)
        .ok_or_else(|| TollgateError::UnsupportedScope {
            policy: policy.name().to_string(),
            scope,
        })?;
    Ok(format!("{}:{}", scope, component))
}

/// The storage key of one (policy, caller key) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Namespace a caller key under its policy's algorithm and name.
    pub fn new(algorithm: Algorithm, policy: &str, key: &str) -> Self {
        Self(format!("{}:{}:{}:{}", NAMESPACE, algorithm, policy, key))
    }

    pub fn for_policy(policy: &Policy, key: &str) -> Self {
        Self::new(policy.algorithm(), policy.name(), key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
