//! Event Canonicalization
//!
//! Turns an event into the deterministic byte sequence its record hash is
//! computed over. Keys are sorted at every depth and no insignificant
//! whitespace is emitted, so the same logical content always produces the
//! same bytes regardless of field insertion order.

pub mod redaction;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::database::models::{IncomingEvent, LedgerEvent};
use crate::error::{LedgerError, Result};

pub use redaction::{RedactionPolicy, RedactionRule, DEFAULT_SENTINEL};

pub const HASH_PREFIX: &str = "sha256:";
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// The hashed fields of an event, after redaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: String,
    pub actor_role: String,
    pub module: String,
    pub payload: Value,
}

impl CanonicalRecord {
    /// Rebuild the hashed fields from a stored row, as recorded.
    pub fn from_stored(event: &LedgerEvent) -> Self {
        Self {
            id: event.id.clone(),
            event_time: event.event_time,
            event_type: event.event_type.clone(),
            actor_id: event.actor_id.clone(),
            actor_role: event.actor_role.clone(),
            module: event.module.clone(),
            payload: event.payload.clone(),
        }
    }

    /// Canonical byte form of this record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push('{');
        write_field(&mut out, "actor_id", &Value::String(self.actor_id.clone()), true);
        write_field(&mut out, "actor_role", &Value::String(self.actor_role.clone()), false);
        write_field(
            &mut out,
            "event_time",
            &Value::String(format_event_time(&self.event_time)),
            false,
        );
        write_field(&mut out, "event_type", &Value::String(self.event_type.clone()), false);
        write_field(&mut out, "id", &Value::String(self.id.clone()), false);
        write_field(&mut out, "module", &Value::String(self.module.clone()), false);
        write_field(&mut out, "payload", &self.payload, false);
        out.push('}');
        out.into_bytes()
    }

    pub fn record_hash(&self) -> String {
        hash_bytes(&self.to_bytes())
    }
}

/// Canonicalizer applying the redaction policy and encoding rules
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    policy: RedactionPolicy,
    max_depth: usize,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(RedactionPolicy::default())
    }
}

impl Canonicalizer {
    pub fn new(policy: RedactionPolicy) -> Self {
        Self {
            policy,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    /// Parse a raw ingress message into an event.
    pub fn parse_message(&self, bytes: &[u8]) -> Result<IncomingEvent> {
        serde_json::from_slice(bytes)
            .map_err(|e| LedgerError::canonicalization(format!("Malformed event message: {}", e)))
    }

    /// Validate, assign an id when missing, normalise and redact an event.
    pub fn prepare(&self, event: &IncomingEvent) -> Result<CanonicalRecord> {
        let id = match &event.id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };

        require_non_blank("id", &id)?;
        require_non_blank("event_type", &event.event_type)?;
        require_non_blank("actor_id", &event.actor_id)?;
        require_non_blank("actor_role", &event.actor_role)?;
        require_non_blank("module", &event.module)?;

        let depth = value_depth(&event.payload);
        if depth > self.max_depth {
            return Err(LedgerError::canonicalization(format!(
                "Payload nesting depth {} exceeds maximum of {}",
                depth, self.max_depth
            )));
        }

        let mut payload = event.payload.clone();
        self.policy.apply(&mut payload);

        Ok(CanonicalRecord {
            id,
            event_time: normalize_event_time(event.event_time),
            event_type: event.event_type.clone(),
            actor_id: event.actor_id.clone(),
            actor_role: event.actor_role.clone(),
            module: event.module.clone(),
            payload,
        })
    }

    /// Canonical bytes of an incoming event (redaction applied).
    pub fn canonicalize(&self, event: &IncomingEvent) -> Result<Vec<u8>> {
        Ok(self.prepare(event)?.to_bytes())
    }

    /// Recompute the record hash of a stored row without re-applying redaction.
    pub fn recompute_hash(&self, event: &LedgerEvent) -> String {
        CanonicalRecord::from_stored(event).record_hash()
    }
}

/// Truncate to the microsecond precision the ledger store keeps.
pub fn normalize_event_time(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(6)
}

pub fn format_event_time(time: &DateTime<Utc>) -> String {
    normalize_event_time(*time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Decode a `sha256:<hex>` string into its 32 digest bytes.
pub fn decode_hash(hash: &str) -> Result<[u8; 32]> {
    let hex_part = hash.strip_prefix(HASH_PREFIX).ok_or_else(|| {
        LedgerError::CryptoError(format!("Hash '{}' is missing the {} prefix", hash, HASH_PREFIX))
    })?;
    let bytes = hex::decode(hex_part)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid hash hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::CryptoError(format!("Hash '{}' is not 32 bytes", hash)))
}

pub fn encode_hash(digest: &[u8; 32]) -> String {
    format!("{}{}", HASH_PREFIX, hex::encode(digest))
}

/// Storage form of a redacted payload: its canonical JSON text. Stores keep
/// this text verbatim so numbers come back exactly as they were hashed.
pub fn payload_to_text(payload: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, payload);
    out
}

pub fn payload_from_text(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| {
        LedgerError::CanonicalizationError(format!("Stored payload is not valid JSON: {}", e))
    })
}

fn require_non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::canonicalization(format!(
            "Field '{}' must not be blank",
            field
        )));
    }
    Ok(())
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn write_field(out: &mut String, key: &str, value: &Value, first: bool) {
    if !first {
        out.push(',');
    }
    write_string(out, key);
    out.push(':');
    write_value(out, value);
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Sort explicitly; serde_json's map order depends on crate features.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // Serializing a str cannot fail.
    let escaped = serde_json::to_string(s).unwrap_or_default();
    out.push_str(&escaped);
}
