//! Service configuration
//!
//! Defaults, then an optional TOML/YAML file, then `LEDGER__`-prefixed
//! environment variables (`LEDGER__ANCHOR__BATCH_SIZE=200`).

pub mod loader;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anchor::{AnchorConfig, FsObjectStore, HttpObjectStore, MemoryObjectStore, ObjectStore};
use crate::canonical::{Canonicalizer, RedactionPolicy, DEFAULT_MAX_DEPTH, DEFAULT_SENTINEL};
use crate::crypto::keys::parse_public_key;
use crate::crypto::{KeyMaterial, LocalSigner, RemoteSigner, Signer};
use crate::database::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use crate::error::{LedgerError, Result};
use crate::ledger::WriterConfig;
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "LEDGER";
pub const MEMORY_DATABASE_URL: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub ledger: LedgerSection,
    pub anchor: AnchorSection,
    pub storage: StorageSection,
    pub signing: SigningSection,
    pub redaction: RedactionSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: MEMORY_DATABASE_URL.to_string(),
            database_max_connections: 10,
            ledger: LedgerSection::default(),
            anchor: AnchorSection::default(),
            storage: StorageSection::default(),
            signing: SigningSection::default(),
            redaction: RedactionSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub lock_timeout_ms: u64,
    pub signer_timeout_ms: u64,
    pub max_sign_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_payload_depth: usize,
    pub feed_capacity: usize,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2000,
            signer_timeout_ms: 5000,
            max_sign_attempts: 4,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2000,
            max_payload_depth: DEFAULT_MAX_DEPTH,
            feed_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSection {
    pub enabled: bool,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub workers: usize,
    pub module: Option<String>,
    pub object_prefix: String,
}

impl Default for AnchorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 500,
            poll_interval_secs: 30,
            workers: 1,
            module: None,
            object_prefix: "audit-ledger".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    Http,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub root_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            root_path: None,
            base_url: None,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningBackend {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSection {
    pub backend: SigningBackend,
    pub key_path: Option<PathBuf>,
    /// Retired keys still trusted for verification: key id -> public key hex.
    pub trusted_keys: BTreeMap<String, String>,
    pub remote_url: Option<String>,
    pub remote_key_id: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SigningSection {
    fn default() -> Self {
        Self {
            backend: SigningBackend::Local,
            key_path: None,
            trusted_keys: BTreeMap::new(),
            remote_url: None,
            remote_key_id: None,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSection {
    pub sentinel: String,
    pub rules: Vec<String>,
    pub policy_path: Option<PathBuf>,
}

impl Default for RedactionSection {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            rules: Vec::new(),
            policy_path: None,
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redaction.rules"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(LedgerError::ConfigError(msg.to_string()));

        if !(self.database_url == MEMORY_DATABASE_URL
            || self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return fail("database_url must be postgres://... or memory://");
        }
        if self.ledger.lock_timeout_ms == 0 || self.ledger.signer_timeout_ms == 0 {
            return fail("ledger timeouts must be greater than zero");
        }
        if self.ledger.max_sign_attempts == 0 {
            return fail("ledger.max_sign_attempts must be at least 1");
        }
        if self.ledger.max_payload_depth == 0 {
            return fail("ledger.max_payload_depth must be at least 1");
        }
        if self.anchor.batch_size == 0 {
            return fail("anchor.batch_size must be greater than zero");
        }
        if self.anchor.poll_interval_secs == 0 {
            return fail("anchor.poll_interval_secs must be greater than zero");
        }
        if self.anchor.module.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return fail("anchor.module must not be blank");
        }

        match self.storage.backend {
            StorageBackend::Filesystem if self.storage.root_path.is_none() => {
                return fail("storage.root_path is required for the filesystem backend")
            }
            StorageBackend::Http if self.storage.base_url.is_none() => {
                return fail("storage.base_url is required for the http backend")
            }
            _ => {}
        }
        if self.storage.request_timeout_ms == 0 || self.signing.request_timeout_ms == 0 {
            return fail("request timeouts must be greater than zero");
        }

        match self.signing.backend {
            SigningBackend::Local if self.signing.key_path.is_none() => {
                return fail("signing.key_path is required for the local signer")
            }
            SigningBackend::Remote if self.signing.remote_url.is_none() => {
                return fail("signing.remote_url is required for the remote signer")
            }
            _ => {}
        }

        if self.redaction.sentinel.is_empty() {
            return fail("redaction.sentinel must not be empty");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ledger.max_sign_attempts,
            base_delay: Duration::from_millis(self.ledger.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.ledger.retry_max_delay_ms),
            attempt_timeout: Duration::from_millis(self.ledger.signer_timeout_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            lock_timeout: Duration::from_millis(self.ledger.lock_timeout_ms),
            sign_policy: self.retry_policy(),
            append_retry: self.retry_policy(),
            feed_capacity: self.ledger.feed_capacity,
        }
    }

    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            batch_size: self.anchor.batch_size,
            module: self.anchor.module.clone(),
            object_prefix: self.anchor.object_prefix.clone(),
            poll_interval: Duration::from_secs(self.anchor.poll_interval_secs),
            sign_policy: self.retry_policy(),
            upload_policy: RetryPolicy {
                attempt_timeout: Duration::from_millis(self.storage.request_timeout_ms),
                ..self.retry_policy()
            },
        }
    }

    /// Inline rules first, then rules from `redaction.policy_path`. A path
    /// listed in both places is rejected as a duplicate.
    pub fn redaction_policy(&self) -> Result<RedactionPolicy> {
        let mut merged = loader::RedactionPolicyFile {
            sentinel: None,
            rules: self
                .redaction
                .rules
                .iter()
                .cloned()
                .map(loader::RuleEntry::Path)
                .collect(),
        };
        if let Some(path) = &self.redaction.policy_path {
            let file = loader::RedactionPolicyFile::load(path)?;
            merged.sentinel = file.sentinel;
            merged.rules.extend(file.rules);
        }
        merged.validate()?;
        merged.into_policy(&self.redaction.sentinel)
    }

    pub fn canonicalizer(&self) -> Result<Canonicalizer> {
        Ok(Canonicalizer::new(self.redaction_policy()?).with_max_depth(self.ledger.max_payload_depth))
    }

    pub fn build_signer(&self) -> Result<Arc<dyn Signer>> {
        let signing = &self.signing;
        match signing.backend {
            SigningBackend::Local => {
                let path = signing.key_path.as_ref().ok_or_else(|| {
                    LedgerError::ConfigError("signing.key_path is not set".to_string())
                })?;
                let mut signer = LocalSigner::new(KeyMaterial::load(path)?);
                for (key_id, public_key_hex) in &signing.trusted_keys {
                    let trusted = signer.trust(parse_public_key(public_key_hex)?);
                    if &trusted != key_id {
                        return Err(LedgerError::ConfigError(format!(
                            "trusted key {} derives key id {}",
                            key_id, trusted
                        )));
                    }
                }
                info!("Using local signer {}", signer.key_id());
                Ok(Arc::new(signer))
            }
            SigningBackend::Remote => {
                let url = signing.remote_url.clone().ok_or_else(|| {
                    LedgerError::ConfigError("signing.remote_url is not set".to_string())
                })?;
                info!("Using remote signer at {}", url);
                Ok(Arc::new(RemoteSigner::new(
                    url,
                    signing.remote_key_id.clone(),
                    Duration::from_millis(signing.request_timeout_ms),
                )?))
            }
        }
    }

    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let storage = &self.storage;
        let missing = |field: &str| LedgerError::ConfigError(format!("storage.{} is not set", field));
        Ok(match storage.backend {
            StorageBackend::Filesystem => {
                let root = storage.root_path.clone().ok_or_else(|| missing("root_path"))?;
                Arc::new(FsObjectStore::new(root))
            }
            StorageBackend::Http => {
                let url = storage.base_url.clone().ok_or_else(|| missing("base_url"))?;
                Arc::new(HttpObjectStore::new(
                    url,
                    Duration::from_millis(storage.request_timeout_ms),
                )?)
            }
            StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
        })
    }

    /// Connect to the configured store, applying migrations for Postgres.
    pub async fn connect_store(&self) -> Result<Arc<dyn LedgerStore>> {
        if self.database_url == MEMORY_DATABASE_URL {
            info!("Using in-memory ledger store");
            return Ok(Arc::new(MemoryLedgerStore::new()));
        }
        let store =
            PgLedgerStore::connect(&self.database_url, self.database_max_connections).await?;
        store.run_migrations().await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            signing: SigningSection {
                key_path: Some(PathBuf::from("/keys/ledger.key")),
                ..SigningSection::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_defaults_need_key_material() {
        assert!(AppConfig::default().validate().is_err());
        valid().validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = valid();
        config.anchor.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.ledger.lock_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.storage.backend = StorageBackend::Http;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.database_url = "mysql://db".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = valid();
        let writer = config.writer_config();
        assert_eq!(writer.lock_timeout, Duration::from_millis(2000));
        assert_eq!(writer.sign_policy.max_attempts, 4);

        let anchor = config.anchor_config();
        assert_eq!(anchor.batch_size, 500);
        assert_eq!(anchor.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_inline_redaction_rules() {
        let mut config = valid();
        config.redaction.rules = vec!["card.pan".to_string()];
        let policy = config.redaction_policy().unwrap();
        assert!(policy.matches("card.pan"));
        assert!(!policy.matches("card.last4"));
    }
}
