//! Rules document
//!
//! The operator-declared mapping from load balancer listeners and
//! forwarding rules to Kubernetes Deployments:
//!
//! ```yaml
//! - load_balancer_id: lb-abc123
//!   listeners:
//!     - port: 443
//!       protocol: HTTPS
//!       rules:
//!         - domain: api.example.com
//!           url: /
//!           backend:
//!             namespace: prod
//!             deployment: api
//!             port: 8080
//! ```
//!
//! A document is parsed whole and never patched; a reload replaces it.

use crate::error::SyncError;
use async_trait::async_trait;
use common::DeploymentKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Declared listeners of one load balancer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoadBalancerRule {
    pub load_balancer_id: String,
    #[serde(default)]
    pub listeners: Vec<ListenerRule>,
}

/// Declared listener, matched against live listeners by port and protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerRule {
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub rules: Vec<PathRule>,
}

/// Declared forwarding rule, matched against live rules by domain and URL
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathRule {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub url: String,
    pub backend: BackendRef,
}

/// Deployment whose pods back a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendRef {
    pub namespace: String,
    pub deployment: String,
    pub port: u16,
}

impl BackendRef {
    pub fn deployment_key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.namespace, &self.deployment)
    }
}

/// Parsed rules document (ordered, immutable)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDocument {
    load_balancers: Vec<LoadBalancerRule>,
}

impl RuleDocument {
    /// Parse a YAML rules document (a top-level sequence)
    ///
    /// An empty document parses to an empty rule set.
    pub fn parse(yaml: &str) -> Result<Self, SyncError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let load_balancers: Vec<LoadBalancerRule> = serde_yaml::from_str(yaml)
            .map_err(|e| SyncError::Rules(format!("failed to parse rules: {}", e)))?;

        Ok(Self { load_balancers })
    }

    pub fn load_balancers(&self) -> &[LoadBalancerRule] {
        &self.load_balancers
    }

    pub fn is_empty(&self) -> bool {
        self.load_balancers.is_empty()
    }

    /// Number of declared (listener, rule) backends across all load balancers
    pub fn declared_backends(&self) -> usize {
        self.load_balancers
            .iter()
            .flat_map(|lb| lb.listeners.iter())
            .map(|listener| listener.rules.len())
            .sum()
    }
}

/// Where the rules document comes from
///
/// Read on every cache refresh so edits are picked up without a restart.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load(&self) -> Result<RuleDocument, SyncError>;
}

/// Rules document stored on disk (typically a mounted ConfigMap)
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn load(&self) -> Result<RuleDocument, SyncError> {
        let data = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::Rules(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        RuleDocument::parse(&data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
- load_balancer_id: lb-abc123
  listeners:
    - port: 443
      protocol: HTTPS
      rules:
        - domain: api.example.com
          url: /
          backend:
            namespace: prod
            deployment: api
            port: 8080
        - domain: api.example.com
          url: /admin
          backend:
            namespace: prod
            deployment: admin
            port: 9000
- load_balancer_id: lb-def456
  listeners:
    - port: 80
      protocol: http
      rules:
        - domain: www.example.com
          url: /
          backend:
            namespace: web
            deployment: frontend
            port: 3000
"#;

    #[test]
    fn test_parse_rules_document() {
        let doc = RuleDocument::parse(SAMPLE).expect("Should parse sample rules");

        assert_eq!(doc.load_balancers().len(), 2);
        assert_eq!(doc.declared_backends(), 3);

        let lb = &doc.load_balancers()[0];
        assert_eq!(lb.load_balancer_id, "lb-abc123");
        assert_eq!(lb.listeners[0].port, 443);
        assert_eq!(lb.listeners[0].protocol, "HTTPS");

        let rule = &lb.listeners[0].rules[1];
        assert_eq!(rule.url, "/admin");
        assert_eq!(rule.backend.deployment_key(), DeploymentKey::new("prod", "admin"));
        assert_eq!(rule.backend.port, 9000);
    }

    #[test]
    fn test_parse_preserves_document_order() {
        let doc = RuleDocument::parse(SAMPLE).expect("Should parse sample rules");
        let ids: Vec<_> = doc
            .load_balancers()
            .iter()
            .map(|lb| lb.load_balancer_id.as_str())
            .collect();
        assert_eq!(ids, vec!["lb-abc123", "lb-def456"]);
    }

    #[test]
    fn test_parse_empty_document() {
        let doc = RuleDocument::parse("   \n").expect("Empty document is valid");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_parse_missing_domain_defaults_to_empty() {
        let yaml = r#"
- load_balancer_id: lb-1
  listeners:
    - port: 80
      protocol: HTTP
      rules:
        - url: /
          backend: { namespace: ns, deployment: app, port: 8080 }
"#;
        let doc = RuleDocument::parse(yaml).expect("Should parse");
        assert_eq!(doc.load_balancers()[0].listeners[0].rules[0].domain, "");
    }

    #[test]
    fn test_parse_invalid_document() {
        let result = RuleDocument::parse("- load_balancer_id: lb-1\n  listeners: [{ port: not-a-port }]\n");
        assert!(matches!(result, Err(SyncError::Rules(_))));
    }

    #[tokio::test]
    async fn test_file_rule_source_reads_from_disk() {
        let path = std::env::temp_dir().join(format!("lbsync-rules-{}.yaml", std::process::id()));
        tokio::fs::write(&path, SAMPLE).await.expect("Should write temp rules");

        let source = FileRuleSource::new(&path);
        let doc = source.load().await.expect("Should load rules from disk");
        assert_eq!(doc.load_balancers().len(), 2);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_file_rule_source_missing_file() {
        let source = FileRuleSource::new("/nonexistent/lbsync/rules.yaml");
        let result = source.load().await;
        assert!(matches!(result, Err(SyncError::Rules(_))));
    }
}
