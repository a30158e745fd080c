//! Namespace keys scoping which instances contend for the same claim.

use std::fmt;

use crate::error::{ElectionError, ElectionResult};

/// Suffix appended to every namespace when building the claim key.
const LEADER_SUFFIX: &str = "leader";

fn sanitize_key_component(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Application name plus deployment environment (plus optional extra parts).
///
/// Only instances with the same namespace contend with each other, so two
/// unrelated services sharing a backend never block one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    parts: Vec<String>,
}

impl Namespace {
    /// Build a namespace from an application name and environment.
    ///
    /// An empty environment is allowed and simply omitted from the key.
    pub fn new(app_name: &str, env: &str) -> ElectionResult<Self> {
        if app_name.trim().is_empty() {
            return Err(ElectionError::Config(
                "leader election namespace requires a non-empty application name".into(),
            ));
        }
        let parts = [app_name, env]
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(sanitize_key_component)
            .collect();
        Ok(Self { parts })
    }

    /// Append an extra component, e.g. a shard or region.
    pub fn with_part(mut self, part: &str) -> Self {
        if !part.trim().is_empty() {
            self.parts.push(sanitize_key_component(part));
        }
        self
    }

    /// Namespace components after sanitization.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The claim key, e.g. `billing/prod/leader`.
    pub fn key(&self) -> String {
        self.key_with('/')
    }

    /// The claim key joined with a custom delimiter.
    pub fn key_with(&self, delimiter: char) -> String {
        let mut key = self.parts.join(&delimiter.to_string());
        key.push(delimiter);
        key.push_str(LEADER_SUFFIX);
        key
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_key() {
        let ns = Namespace::new("billing", "prod").unwrap();
        assert_eq!(ns.key(), "billing/prod/leader");
        assert_eq!(ns.key_with('.'), "billing.prod.leader");
        assert_eq!(ns.to_string(), "billing/prod/leader");
    }

    #[test]
    fn test_namespace_sanitizes_components() {
        let ns = Namespace::new("my app", "eu/west:1").unwrap();
        assert_eq!(ns.parts(), &["my_app".to_string(), "eu_west_1".to_string()]);
    }

    #[test]
    fn test_namespace_empty_env_omitted() {
        let ns = Namespace::new("billing", "").unwrap();
        assert_eq!(ns.key(), "billing/leader");
    }

    #[test]
    fn test_namespace_extra_part() {
        let ns = Namespace::new("billing", "prod").unwrap().with_part("shard-3");
        assert_eq!(ns.key(), "billing/prod/shard-3/leader");
    }

    #[test]
    fn test_namespace_requires_app_name() {
        let err = Namespace::new("  ", "prod").unwrap_err();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[test]
    fn test_namespaces_differ_by_env() {
        let prod = Namespace::new("billing", "prod").unwrap();
        let staging = Namespace::new("billing", "staging").unwrap();
        assert_ne!(prod.key(), staging.key());
    }
}
