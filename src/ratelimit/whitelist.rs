//! Route whitelist matching.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A whitelist entry as written in configuration.
///
/// ```yaml
/// whitelist:
///   - prefix: /health
///   - regex: "^/api/v1/public/"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistRule {
    /// Literal path prefix
    Prefix(String),
    /// Regular expression searched anywhere in the path
    Regex(String),
}

/// Compiled whitelist. Matching paths bypass rate limiting.
#[derive(Debug, Clone)]
pub struct Whitelist {
    prefixes: Vec<String>,
    patterns: RegexSet,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            patterns: RegexSet::empty(),
        }
    }
}

impl Whitelist {
    /// Compile the rules. Fails on the first invalid regular expression.
    pub fn compile(rules: &[WhitelistRule]) -> Result<Self> {
        let mut prefixes = Vec::new();
        let mut patterns = Vec::new();
        for rule in rules {
            match rule {
                WhitelistRule::Prefix(prefix) => prefixes.push(prefix.clone()),
                WhitelistRule::Regex(pattern) => patterns.push(pattern.as_str()),
            }
        }
        Ok(Self {
            prefixes,
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
            || self.patterns.is_match(path)
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matches_nothing() {
        let whitelist = Whitelist::default();
        assert!(whitelist.is_empty());
        assert!(!whitelist.matches("/health"));
    }

    #[test]
    fn test_prefix_and_regex_rules() {
        let whitelist = Whitelist::compile(&[
            WhitelistRule::Prefix("/health".to_string()),
            WhitelistRule::Regex(r"^/static/.*\.(css|js)$".to_string()),
        ])
        .unwrap();

        assert!(whitelist.matches("/health"));
        assert!(whitelist.matches("/healthz"));
        assert!(whitelist.matches("/static/app.css"));
        assert!(!whitelist.matches("/static/logo.png"));
        assert!(!whitelist.matches("/api/health"));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let result = Whitelist::compile(&[WhitelistRule::Regex("([a-z".to_string())]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rule_serde() {
        let rules: Vec<WhitelistRule> =
            serde_yaml::from_str("- prefix: /docs\n- regex: ^/public\n").unwrap();
        assert_eq!(
            rules,
            vec![
                WhitelistRule::Prefix("/docs".to_string()),
                WhitelistRule::Regex("^/public".to_string()),
            ]
        );
    }
}
