//! Ordered policy catalog and request matching.
//!
//! Matching is a linear scan in declaration order: the first policy whose
//! method set and path expression both match wins. Policies are never
//! reordered by specificity, so put narrow rules before broad ones.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::policy::{Policy, PolicyDefinition};
use crate::error::{Result, TollgateError};

/// A policy file: either a bare list or a `policies:` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Document { policies: Vec<PolicyDefinition> },
    List(Vec<PolicyDefinition>),
}

/// An immutable, validated, ordered set of policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: Vec<Arc<Policy>>,
}

impl PolicyCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a list of definitions.
    ///
    /// The whole list is rejected if any definition is invalid or if two
    /// policies share a name.
    pub fn from_definitions(definitions: &[PolicyDefinition]) -> Result<Self> {
        let mut names = HashSet::with_capacity(definitions.len());
        let mut policies = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let policy = definition.compile()?;
            if !names.insert(policy.name().to_string()) {
                return Err(TollgateError::Config(format!(
                    "duplicate policy name '{}'",
                    policy.name()
                )));
            }
            policies.push(Arc::new(policy));
        }

        Ok(Self { policies })
    }

    /// Load a catalog from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a catalog from a YAML (or JSON) string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy config: {}", e)))?;
        match file {
            PolicyFile::Document { policies } | PolicyFile::List(policies) => {
                Self::from_definitions(&policies)
            }
        }
    }

    /// First policy, in declaration order, that applies to the request.
    pub fn find_match(&self, method: &str, path: &str) -> Option<&Arc<Policy>> {
        self.policies.iter().find(|p| p.matches(method, path))
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Policy>> {
        self.policies.iter().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICIES: &str = r#"
policies:
  - name: uploads
    algorithm: leaky_bucket
    rate: 1
    period: 10
    burst: 2
    scope: user
    path_pattern: "^/v1/ingest"
    methods: [POST]
  - name: search
    rate: 20
    period: 1
    burst: 40
    scope: tenant
    path_pattern: "^/v1/search"
  - name: catch_all
    rate: 100
    period: 60
    burst: 100
    scope: ip
"#;

    #[test]
    fn test_parse_document_form() {
        let catalog = PolicyCatalog::from_yaml(POLICIES).unwrap();
        assert_eq!(catalog.len(), 3);
        let names: Vec<_> = catalog.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["uploads", "search", "catch_all"]);
    }

    #[test]
    fn test_parse_bare_list_and_json() {
        let yaml = r#"
- {name: a, rate: 1, period: 1, burst: 1}
- {name: b, rate: 2, period: 1, burst: 2}
"#;
        assert_eq!(PolicyCatalog::from_yaml(yaml).unwrap().len(), 2);

        let json = r#"{"policies": [{"name": "a", "rate": 1, "period": 1, "burst": 1}]}"#;
        assert_eq!(PolicyCatalog::from_yaml(json).unwrap().len(), 1);
    }

    #[test]
    fn test_first_match_in_declaration_order() {
        let catalog = PolicyCatalog::from_yaml(POLICIES).unwrap();

        assert_eq!(catalog.find_match("POST", "/v1/ingest/doc").unwrap().name(), "uploads");
        // uploads is POST-only; GET falls through to the catch-all
        assert_eq!(catalog.find_match("GET", "/v1/ingest/doc").unwrap().name(), "catch_all");
        assert_eq!(catalog.find_match("get", "/v1/search?q=x").unwrap().name(), "search");
        assert_eq!(catalog.find_match("DELETE", "/anything").unwrap().name(), "catch_all");
    }

    #[test]
    fn test_broad_policy_first_shadows_narrow_one() {
        let yaml = r#"
- {name: broad, rate: 1, period: 1, burst: 1, path_pattern: "^/v1/"}
- {name: narrow, rate: 1, period: 1, burst: 1, path_pattern: "^/v1/search$"}
"#;
        let catalog = PolicyCatalog::from_yaml(yaml).unwrap();
        assert_eq!(catalog.find_match("GET", "/v1/search").unwrap().name(), "broad");
    }

    #[test]
    fn test_no_match() {
        let yaml = r#"[{name: a, rate: 1, period: 1, burst: 1, path_pattern: "^/v1/"}]"#;
        let catalog = PolicyCatalog::from_yaml(yaml).unwrap();
        assert!(catalog.find_match("GET", "/healthz").is_none());
        assert!(PolicyCatalog::new().find_match("GET", "/v1/x").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
- {name: a, rate: 1, period: 1, burst: 1}
- {name: a, rate: 2, period: 1, burst: 2}
"#;
        let err = PolicyCatalog::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollgateError::Config(ref msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_one_bad_policy_rejects_whole_set() {
        let yaml = r#"
- {name: good, rate: 1, period: 1, burst: 1}
- {name: bad, rate: 0, period: 1, burst: 1}
"#;
        assert!(PolicyCatalog::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_sample_policy_file() {
        let catalog = PolicyCatalog::from_yaml(include_str!("../../config/policies.yaml")).unwrap();
        assert_eq!(catalog.len(), 4);
        assert_eq!(
            catalog.find_match("POST", "/v1/ingest/batch").unwrap().name(),
            "ingest_per_user"
        );
        assert_eq!(catalog.find_match("GET", "/v1/ingest/42").unwrap().name(), "api_per_ip");
        assert_eq!(catalog.find_match("POST", "/v1/search").unwrap().name(), "api_per_ip");
        assert!(catalog.find_match("GET", "/healthz").is_none());
    }

    #[test]
    fn test_get_by_name() {
        let catalog = PolicyCatalog::from_yaml(POLICIES).unwrap();
        assert_eq!(catalog.get("search").unwrap().burst(), 40);
        assert!(catalog.get("missing").is_none());
    }
}
