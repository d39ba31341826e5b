//! Rate limit policy definitions and validation.
//!
//! Policies are declared in YAML (or JSON) as [`PolicyDefinition`] records and
//! compiled into immutable [`Policy`] values. Compilation is where every
//! invariant is checked: positive throughput parameters, a valid path
//! expression and a non-empty method set.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::bucket::BucketParams;
use crate::error::{Result, TollgateError};

/// The bucket algorithm a policy uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Refilling pool of permits; starts full.
    #[default]
    TokenBucket,
    /// Draining level; starts empty.
    LeakyBucket,
}

impl Algorithm {
    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dimension along which independent quotas are tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per client address
    #[default]
    Ip,
    /// Per authenticated user
    User,
    /// Per tenant
    Tenant,
    /// One bucket shared by every caller
    Global,
    /// Per caller-defined key
    Custom,
}

impl Scope {
    /// The configuration name of this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Tenant => "tenant",
            Scope::Global => "global",
            Scope::Custom => "custom",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method restriction as written in configuration.
///
/// Either a keyword (`any` or `*`) or an explicit list of verbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodsDefinition {
    Keyword(String),
    List(Vec<String>),
}

/// Compiled method restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Methods {
    /// Every method matches.
    Any,
    /// Only these upper-cased verbs match.
    Only(BTreeSet<String>),
}

impl Methods {
    /// Whether `method` is allowed by this restriction (case-insensitive).
    pub fn contains(&self, method: &str) -> bool {
        match self {
            Methods::Any => true,
            Methods::Only(verbs) => verbs.contains(&method.to_ascii_uppercase()),
        }
    }
}

/// A policy record as it appears in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDefinition {
    /// Unique policy name
    pub name: String,
    /// Bucket algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Permits per period
    pub rate: i64,
    /// Period length in seconds
    pub period: i64,
    /// Bucket capacity
    pub burst: i64,
    /// Keying dimension
    #[serde(default)]
    pub scope: Scope,
    /// Regular expression searched for in the request path
    #[serde(default = "default_path_pattern")]
    pub path_pattern: String,
    /// Method restriction; absent means any method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<MethodsDefinition>,
    /// Default cost per request
    #[serde(default = "default_cost")]
    pub cost: i64,
    /// Free-form annotations, carried but not interpreted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_path_pattern() -> String {
    ".*".to_string()
}

fn default_cost() -> i64 {
    1
}

/// An immutable, validated rate limit policy.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    algorithm: Algorithm,
    rate: u32,
    period: u32,
    burst: u32,
    scope: Scope,
    path_pattern: Regex,
    methods: Methods,
    cost: u32,
    metadata: BTreeMap<String, String>,
}

impl PolicyDefinition {
    /// Validate this definition and compile it into a [`Policy`].
    pub fn compile(&self) -> Result<Policy> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(TollgateError::Config(
                "policy name must not be empty".to_string(),
            ));
        }

        let rate = positive(name, "rate", self.rate)?;
        let period = positive(name, "period", self.period)?;
        let burst = positive(name, "burst", self.burst)?;
        let cost = positive(name, "cost", self.cost)?;
        if cost > burst {
            return Err(TollgateError::Config(format!(
                "policy '{}': cost {} exceeds burst {}",
                name, cost, burst
            )));
        }

        let path_pattern = Regex::new(&self.path_pattern).map_err(|e| {
            TollgateError::Config(format!(
                "policy '{}': invalid path_pattern '{}': {}",
                name, self.path_pattern, e
            ))
        })?;

        let methods = match &self.methods {
            None => Methods::Any,
            Some(MethodsDefinition::Keyword(word)) if word == "*" || word.eq_ignore_ascii_case("any") => {
                Methods::Any
            }
            Some(MethodsDefinition::Keyword(word)) => {
                return Err(TollgateError::Config(format!(
                    "policy '{}': methods must be a list of verbs or \"any\", got '{}'",
                    name, word
                )));
            }
            Some(MethodsDefinition::List(verbs)) => {
                let verbs: BTreeSet<String> = verbs
                    .iter()
                    .map(|v| v.trim().to_ascii_uppercase())
                    .filter(|v| !v.is_empty())
                    .collect();
                if verbs.is_empty() {
                    return Err(TollgateError::Config(format!(
                        "policy '{}': methods list is empty (omit it or use \"any\")",
                        name
                    )));
                }
                Methods::Only(verbs)
            }
        };

        Ok(Policy {
            name: name.to_string(),
            algorithm: self.algorithm,
            rate,
            period,
            burst,
            scope: self.scope,
            path_pattern,
            methods,
            cost,
            metadata: self.metadata.clone(),
        })
    }
}

fn positive(policy: &str, field: &str, value: i64) -> Result<u32> {
    if value <= 0 {
        return Err(TollgateError::Config(format!(
            "policy '{}': {} must be positive, got {}",
            policy, field, value
        )));
    }
    u32::try_from(value).map_err(|_| {
        TollgateError::Config(format!(
            "policy '{}': {} is too large ({})",
            policy, field, value
        ))
    })
}

impl Policy {
    /// Parse and compile a single policy from YAML or JSON.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PolicyDefinition = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy: {}", e)))?;
        definition.compile()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn methods(&self) -> &Methods {
        &self.methods
    }

    /// Default cost charged when the caller does not supply one.
    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn path_pattern(&self) -> &str {
        self.path_pattern.as_str()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Throughput parameters handed to the bucket algorithm.
    pub fn params(&self) -> BucketParams {
        BucketParams {
            rate: self.rate,
            period: self.period,
            burst: self.burst,
        }
    }

    /// Whether this policy applies to a request.
    ///
    /// The path expression is searched anywhere in the path; anchor it with
    /// `^...$` for an exact match.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.methods.contains(method) && self.path_pattern.is_match(path)
    }

    /// Convert back into its configuration form.
    pub fn to_definition(&self) -> PolicyDefinition {
        PolicyDefinition {
            name: self.name.clone(),
            algorithm: self.algorithm,
            rate: i64::from(self.rate),
            period: i64::from(self.period),
            burst: i64::from(self.burst),
            scope: self.scope,
            path_pattern: self.path_pattern.as_str().to_string(),
            methods: match &self.methods {
                Methods::Any => None,
                Methods::Only(verbs) => Some(MethodsDefinition::List(verbs.iter().cloned().collect())),
            },
            cost: i64::from(self.cost),
            metadata: self.metadata.clone(),
        }
    }
}
