//! Redaction Policy
//!
//! Ordered table of payload path patterns whose values are replaced with a
//! fixed sentinel before an event is hashed. Paths are dotted (`card.pan`),
//! `*` matches exactly one segment, `**` any number of segments, and array
//! elements are addressed by their numeric index (`accounts.*.iban`).

use glob::{MatchOptions, Pattern};
use serde_json::Value;
use tracing::debug;

use crate::error::{LedgerError, Result};

pub const DEFAULT_SENTINEL: &str = "[REDACTED]";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A single compiled redaction rule
#[derive(Debug, Clone)]
pub struct RedactionRule {
    source: String,
    pattern: Pattern,
}

impl RedactionRule {
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::ConfigError(
                "Redaction rule cannot be empty".to_string(),
            ));
        }
        if trimmed.contains('/') {
            return Err(LedgerError::ConfigError(format!(
                "Redaction rule '{}' must use '.' as separator",
                trimmed
            )));
        }

        let pattern = Pattern::new(&trimmed.replace('.', "/")).map_err(|e| {
            LedgerError::ConfigError(format!("Invalid redaction rule '{}': {}", trimmed, e))
        })?;

        Ok(Self {
            source: trimmed.to_string(),
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }
}

/// Redaction policy applied by the canonicalizer
#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    rules: Vec<RedactionRule>,
    sentinel: String,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            sentinel: DEFAULT_SENTINEL.to_string(),
        }
    }
}

impl RedactionPolicy {
    pub fn new<S: AsRef<str>>(rules: &[S], sentinel: &str) -> Result<Self> {
        if sentinel.is_empty() {
            return Err(LedgerError::ConfigError(
                "Redaction sentinel cannot be empty".to_string(),
            ));
        }

        let rules = rules
            .iter()
            .map(|r| RedactionRule::parse(r.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            sentinel: sentinel.to_string(),
        })
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn rules(&self) -> &[RedactionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule matches the given dotted path
    pub fn matches(&self, dotted_path: &str) -> bool {
        let path = dotted_path.replace('.', "/");
        self.rules.iter().any(|rule| rule.matches(&path))
    }

    /// Replace every matched value in `payload` with the sentinel.
    ///
    /// The first matching node wins; its subtree is not visited. Returns the
    /// number of replaced values.
    pub fn apply(&self, payload: &mut Value) -> usize {
        if self.rules.is_empty() {
            return 0;
        }
        let mut segments = Vec::new();
        let redacted = self.redact_node(payload, &mut segments);
        if redacted > 0 {
            debug!("Redacted {} payload field(s)", redacted);
        }
        redacted
    }

    fn redact_node(&self, node: &mut Value, segments: &mut Vec<String>) -> usize {
        match node {
            Value::Object(map) => {
                let mut count = 0;
                for (key, child) in map.iter_mut() {
                    segments.push(key.clone());
                    count += self.redact_child(child, segments);
                    segments.pop();
                }
                count
            }
            Value::Array(items) => {
                let mut count = 0;
                for (index, child) in items.iter_mut().enumerate() {
                    segments.push(index.to_string());
                    count += self.redact_child(child, segments);
                    segments.pop();
                }
                count
            }
            _ => 0,
        }
    }

    fn redact_child(&self, child: &mut Value, segments: &mut Vec<String>) -> usize {
        let path = segments.join("/");
        if self.rules.iter().any(|rule| rule.matches(&path)) {
            *child = Value::String(self.sentinel.clone());
            1
        } else {
            self.redact_node(child, segments)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_path_redaction() {
        let policy = RedactionPolicy::new(&["card.pan"], DEFAULT_SENTINEL).unwrap();
        let mut payload = json!({"card": {"pan": "4111111111111111", "last4": "1111"}});

        assert_eq!(policy.apply(&mut payload), 1);
        assert_eq!(payload["card"]["pan"], DEFAULT_SENTINEL);
        assert_eq!(payload["card"]["last4"], "1111");
    }

    #[test]
    fn test_wildcard_segments() {
        let policy =
            RedactionPolicy::new(&["accounts.*.iban", "**.password"], DEFAULT_SENTINEL).unwrap();
        let mut payload = json!({
            "accounts": [{"iban": "DE89370400440532013000"}, {"iban": "GB33BUKB20201555555555"}],
            "login": {"form": {"password": "hunter2"}},
            "password": "top-level"
        });

        assert_eq!(policy.apply(&mut payload), 4);
        assert_eq!(payload["accounts"][0]["iban"], DEFAULT_SENTINEL);
        assert_eq!(payload["accounts"][1]["iban"], DEFAULT_SENTINEL);
        assert_eq!(payload["login"]["form"]["password"], DEFAULT_SENTINEL);
        assert_eq!(payload["password"], DEFAULT_SENTINEL);
    }

    #[test]
    fn test_single_star_does_not_cross_segments() {
        let policy = RedactionPolicy::new(&["*.raw"], DEFAULT_SENTINEL).unwrap();
        let mut payload = json!({"biometrics": {"raw": "AAAA"}, "deep": {"x": {"raw": "BBBB"}}});

        assert_eq!(policy.apply(&mut payload), 1);
        assert_eq!(payload["biometrics"]["raw"], DEFAULT_SENTINEL);
        assert_eq!(payload["deep"]["x"]["raw"], "BBBB");
    }

    #[test]
    fn test_whole_subtree_replaced() {
        let policy = RedactionPolicy::new(&["biometrics"], "***").unwrap();
        let mut payload = json!({"biometrics": {"raw": "AAAA", "format": "iso"}});

        assert_eq!(policy.apply(&mut payload), 1);
        assert_eq!(payload["biometrics"], "***");
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let policy = RedactionPolicy::new(&["card.pan"], DEFAULT_SENTINEL).unwrap();
        let mut payload = json!({"card": {"pan": "4111"}});
        policy.apply(&mut payload);
        let once = payload.clone();
        policy.apply(&mut payload);
        assert_eq!(payload, once);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(RedactionRule::parse("").is_err());
        assert!(RedactionRule::parse("card/pan").is_err());
        assert!(RedactionRule::parse("card.[pan").is_err());
        assert!(RedactionPolicy::new(&["card.pan"], "").is_err());
    }

    #[test]
    fn test_matches_dotted_path() {
        let policy = RedactionPolicy::new(&["card.pan"], DEFAULT_SENTINEL).unwrap();
        assert!(policy.matches("card.pan"));
        assert!(!policy.matches("card.last4"));
    }
}
