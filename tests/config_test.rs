//! Configuration Tests
//!
//! Loading TOML and YAML files, redaction policy files, and building the
//! signer and object store from configuration.

use std::io::Write;
use std::path::Path;

use audit_ledger::config::{AppConfig, SigningBackend, StorageBackend};
use audit_ledger::crypto::KeyMaterial;
use audit_ledger::error::LedgerError;
use serde_json::json;
use tempfile::{Builder, NamedTempFile, TempDir};

mod common;
use common::*;

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn write_key(dir: &TempDir) -> (KeyMaterial, std::path::PathBuf) {
    let key = KeyMaterial::generate();
    let path = dir.path().join("ledger.key");
    key.save(&path).unwrap();
    (key, path)
}

fn escaped(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\")
}

#[test]
fn test_load_toml_file() {
    let dir = TempDir::new().unwrap();
    let (_, key_path) = write_key(&dir);
    let file = write_config(
        ".toml",
        &format!(
            r#"
database_url = "memory://"

[ledger]
lock_timeout_ms = 750

[anchor]
batch_size = 64
module = "payments"
object_prefix = "acme/audit"

[storage]
backend = "filesystem"
root_path = "{root}"

[signing]
backend = "local"
key_path = "{key}"

[redaction]
rules = ["card.pan"]
"#,
            root = escaped(dir.path()),
            key = escaped(&key_path)
        ),
    );

    let config = AppConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.ledger.lock_timeout_ms, 750);
    assert_eq!(config.ledger.max_sign_attempts, 4);
    assert_eq!(config.anchor.batch_size, 64);
    assert_eq!(config.anchor.module.as_deref(), Some("payments"));
    assert_eq!(config.storage.backend, StorageBackend::Filesystem);
    assert_eq!(config.signing.backend, SigningBackend::Local);

    let anchor = config.anchor_config();
    assert_eq!(anchor.object_prefix, "acme/audit");
    assert_eq!(anchor.batch_size, 64);

    config.build_signer().unwrap();
    config.build_object_store().unwrap();
    assert!(config.redaction_policy().unwrap().matches("card.pan"));
}

#[test]
fn test_load_yaml_with_remote_services() {
    let file = write_config(
        ".yaml",
        r#"
database_url: "postgres://ledger@localhost/audit"
storage:
  backend: http
  base_url: "http://objects.internal/bucket"
signing:
  backend: remote
  remote_url: "http://kms.internal"
  remote_key_id: "kms:ledger-1"
"#,
    );

    let config = AppConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Http);
    assert_eq!(config.signing.backend, SigningBackend::Remote);

    let signer = config.build_signer().unwrap();
    assert_eq!(signer.key_id(), "kms:ledger-1");
    config.build_object_store().unwrap();
}

#[test]
fn test_invalid_file_is_rejected() {
    let file = write_config(
        ".toml",
        r#"
[anchor]
batch_size = 0

[signing]
key_path = "/keys/ledger.key"
"#,
    );
    assert!(matches!(
        AppConfig::load(Some(file.path())),
        Err(LedgerError::ConfigError(_))
    ));

    let missing = Path::new("/nonexistent/ledger.toml");
    assert!(matches!(
        AppConfig::load(Some(missing)),
        Err(LedgerError::ConfigError(_))
    ));
}

#[test]
fn test_trusted_keys_must_match_their_ids() {
    let dir = TempDir::new().unwrap();
    let (_, key_path) = write_key(&dir);
    let retired = KeyMaterial::generate();

    let mut config = AppConfig::default();
    config.signing.key_path = Some(key_path);
    config
        .signing
        .trusted_keys
        .insert(retired.key_id.clone(), retired.public_key_hex());
    config.validate().unwrap();
    config.build_signer().unwrap();

    config
        .signing
        .trusted_keys
        .insert("secp256k1:not-this-key".to_string(), retired.public_key_hex());
    assert!(matches!(
        config.build_signer(),
        Err(LedgerError::ConfigError(_))
    ));
}

#[test]
fn test_redaction_policy_file_merges_with_inline_rules() {
    let dir = TempDir::new().unwrap();
    let (_, key_path) = write_key(&dir);
    let policy = write_config(
        ".yaml",
        r#"
sentinel: "<removed>"
rules:
  - biometrics.raw
  - path: card.pan
    reason: PCI scope
"#,
    );

    let mut config = AppConfig::default();
    config.signing.key_path = Some(key_path);
    config.redaction.rules = vec!["session.token".to_string()];
    config.redaction.policy_path = Some(policy.path().to_path_buf());

    let canonicalizer = config.canonicalizer().unwrap();
    let event = test_event(
        "evt-1",
        "auth",
        json!({
            "card": {"pan": "4111111111111111"},
            "biometrics": {"raw": "AAAA"},
            "session": {"token": "secret", "ip": "10.0.0.1"}
        }),
    );
    let text = String::from_utf8(canonicalizer.canonicalize(&event).unwrap()).unwrap();
    assert!(text.contains(r#""pan":"<removed>""#));
    assert!(text.contains(r#""raw":"<removed>""#));
    assert!(text.contains(r#""token":"<removed>""#));
    assert!(text.contains(r#""ip":"10.0.0.1""#));
}

#[test]
fn test_duplicate_policy_rules_are_rejected() {
    let policy = write_config(
        ".yaml",
        r#"
rules:
  - card.pan
  - path: card.pan
"#,
    );

    let mut config = AppConfig::default();
    config.redaction.policy_path = Some(policy.path().to_path_buf());
    assert!(matches!(
        config.redaction_policy(),
        Err(LedgerError::ConfigError(_))
    ));
}

#[test]
fn test_rule_repeated_inline_and_in_file_is_rejected() {
    let policy = write_config(".yaml", "rules:\n  - card.pan\n");

    let mut config = AppConfig::default();
    config.redaction.rules = vec!["card.pan".to_string()];
    config.redaction.policy_path = Some(policy.path().to_path_buf());
    assert!(matches!(
        config.redaction_policy(),
        Err(LedgerError::ConfigError(_))
    ));

    // Without a file sentinel the configured one applies.
    config.redaction.rules = vec!["session.token".to_string()];
    config.redaction.sentinel = "<gone>".to_string();
    let policy = config.redaction_policy().unwrap();
    assert_eq!(policy.sentinel(), "<gone>");
    assert!(policy.matches("card.pan"));
    assert!(policy.matches("session.token"));
}
