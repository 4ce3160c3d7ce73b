//! Bypass System - Per-destination interception gate
//!
//! An interception attempt consults a [`BypassEvaluator`] with the sniffed
//! server name and, when known, the real destination address. `Deny` means
//! the connection must not be decrypted and is passed through untouched.
//!
//! [`StaticBypass`] is the shipped evaluator: a named set of exact and
//! wildcard (`*.example.com`) host rules. By default a matching host is
//! denied interception; in whitelist mode only matching hosts are allowed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::debug;

/// Outcome of a bypass evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassDecision {
    /// Interception may proceed
    Allow,
    /// Pass the connection through without interception
    Deny,
}

/// Decides whether a destination may be intercepted
///
/// Implementations may perform I/O but should be fast; the caller does not
/// apply a separate timeout to this call.
#[async_trait]
pub trait BypassEvaluator: Send + Sync {
    /// Evaluate `host` (and the real destination when known)
    async fn decide(&self, host: &str, destination: Option<SocketAddr>) -> BypassDecision;
}

/// Serialized form of a static bypass rule set
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BypassConfig {
    /// Registry name
    pub name: String,

    /// Host patterns: exact names, `*.suffix` wildcards or IP addresses
    #[serde(default)]
    pub matchers: Vec<String>,

    /// Invert matching: only matching hosts may be intercepted
    #[serde(default)]
    pub whitelist: bool,
}

/// Static exact/wildcard bypass rules
#[derive(Debug, Clone)]
pub struct StaticBypass {
    exact: HashSet<String>,
    wildcards: Vec<String>,
    whitelist: bool,
}

impl StaticBypass {
    /// Build from a rule set
    pub fn new(config: &BypassConfig) -> Self {
        let mut exact = HashSet::new();
        let mut wildcards = Vec::new();

        for pattern in &config.matchers {
            let pattern = normalize(pattern);
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_prefix("*.") {
                Some(domain) => wildcards.push(domain.to_string()),
                None => {
                    exact.insert(pattern);
                }
            }
        }

        debug!(
            name = %config.name,
            exact = exact.len(),
            wildcards = wildcards.len(),
            whitelist = config.whitelist,
            "Loaded static bypass rules"
        );

        Self {
            exact,
            wildcards,
            whitelist: config.whitelist,
        }
    }

    /// Check if any rule matches the host or destination IP
    pub fn matches(&self, host: &str, destination: Option<SocketAddr>) -> bool {
        let host = normalize(host);

        if self.exact.contains(&host) {
            return true;
        }

        if self.wildcards.iter().any(|domain| matches_wildcard(domain, &host)) {
            return true;
        }

        destination.is_some_and(|addr| self.exact.contains(&addr.ip().to_string()))
    }

    /// Number of loaded rules
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// Check if no rules are loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BypassEvaluator for StaticBypass {
    async fn decide(&self, host: &str, destination: Option<SocketAddr>) -> BypassDecision {
        let matched = self.matches(host, destination);
        let decision = if matched != self.whitelist {
            BypassDecision::Deny
        } else {
            BypassDecision::Allow
        };

        debug!(host = %host, matched, decision = ?decision, "Bypass evaluated");
        decision
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `*.example.com` covers `example.com` and any subdomain, not `badexample.com`
fn matches_wildcard(domain: &str, host: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bypass(matchers: &[&str], whitelist: bool) -> StaticBypass {
        StaticBypass::new(&BypassConfig {
            name: "test".to_string(),
            matchers: matchers.iter().map(|s| s.to_string()).collect(),
            whitelist,
        })
    }

    #[test]
    fn test_exact_match() {
        let rules = bypass(&["bank.example.com"], false);
        assert!(rules.matches("bank.example.com", None));
        assert!(rules.matches("BANK.example.com.", None));
        assert!(!rules.matches("other.example.com", None));
    }

    #[test]
    fn test_wildcard_match() {
        let rules = bypass(&["*.apple.com"], false);
        assert!(rules.matches("apple.com", None));
        assert!(rules.matches("api.apple.com", None));
        assert!(rules.matches("a.b.apple.com", None));
        assert!(!rules.matches("notapple.com", None));
    }

    #[test]
    fn test_destination_ip_match() {
        let rules = bypass(&["10.0.0.1"], false);
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert!(rules.matches("unrelated.example", Some(addr)));
        assert!(!rules.matches("unrelated.example", None));
    }

    #[tokio::test]
    async fn test_blacklist_decision() {
        let rules = bypass(&["*.pinned.example"], false);
        assert_eq!(
            rules.decide("app.pinned.example", None).await,
            BypassDecision::Deny
        );
        assert_eq!(rules.decide("example.org", None).await, BypassDecision::Allow);
    }

    #[tokio::test]
    async fn test_whitelist_decision() {
        let rules = bypass(&["inspect.example"], true);
        assert_eq!(
            rules.decide("inspect.example", None).await,
            BypassDecision::Allow
        );
        assert_eq!(rules.decide("example.org", None).await, BypassDecision::Deny);
    }

    #[test]
    fn test_config_deserialize() {
        let config: BypassConfig =
            serde_json::from_str(r#"{"name":"b","matchers":["*.x.com"]}"#).unwrap();
        assert_eq!(config.name, "b");
        assert!(!config.whitelist);
        assert_eq!(StaticBypass::new(&config).len(), 1);
    }
}
