//! Redaction policy file loader
//! Loads the YAML table of sensitive payload paths
//!
//! ```yaml
//! sentinel: "[REDACTED]"
//! rules:
//!   - card.pan
//!   - path: biometrics.raw
//!     reason: raw templates never leave the MFA service
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::canonical::{RedactionPolicy, RedactionRule};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RuleEntry {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl RuleEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Detailed { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedactionPolicyFile {
    #[serde(default)]
    pub sentinel: Option<String>,
    pub rules: Vec<RuleEntry>,
}

impl RedactionPolicyFile {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading redaction policy from: {:?}", path);

        if !path.exists() {
            return Err(LedgerError::ConfigError(format!(
                "Redaction policy file not found: {:?}",
                path
            )));
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            LedgerError::ConfigError(format!("Failed to read {:?}: {}", path, e))
        })?;

        let file = Self::parse(&contents)
            .map_err(|e| LedgerError::ConfigError(format!("{:?}: {}", path, e)))?;
        info!("Loaded {} redaction rules", file.rules.len());
        Ok(file)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(contents)
            .map_err(|e| LedgerError::ConfigError(format!("Failed to parse policy: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if matches!(&self.sentinel, Some(s) if s.is_empty()) {
            return Err(LedgerError::ConfigError(
                "Redaction sentinel must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.rules {
            RedactionRule::parse(entry.path())?;
            if !seen.insert(entry.path()) {
                return Err(LedgerError::ConfigError(format!(
                    "Duplicate redaction rule: {}",
                    entry.path()
                )));
            }
        }
        Ok(())
    }

    pub fn paths(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.path().to_string()).collect()
    }

    pub fn into_policy(self, default_sentinel: &str) -> Result<RedactionPolicy> {
        let sentinel = self.sentinel.clone().unwrap_or_else(|| default_sentinel.to_string());
        RedactionPolicy::new(&self.paths(), &sentinel)
    }
}
