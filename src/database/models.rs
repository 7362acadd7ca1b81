use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event as handed over by a producer, before it has a chain position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: String,
    pub actor_role: String,
    pub module: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One committed ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub append_order: i64,
    pub id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: String,
    pub actor_role: String,
    pub module: String,
    /// Payload after redaction; this is what the record hash covers.
    pub payload: serde_json::Value,
    pub prev_hash: Option<String>,
    pub record_hash: String,
    pub signer_key_id: String,
    pub signature: String,
    pub uploaded: bool,
    pub anchor_object_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Row handed to an append transaction; `append_order` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewLedgerRow {
    pub id: String,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: String,
    pub actor_role: String,
    pub module: String,
    pub payload: serde_json::Value,
    pub prev_hash: Option<String>,
    pub record_hash: String,
    pub signer_key_id: String,
    pub signature: String,
}

/// Last committed position of the chain, read under the append lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTail {
    pub append_order: i64,
    pub record_hash: String,
}

/// Batch manifest row: one Merkle commitment over a contiguous window of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: Uuid,
    pub module: Option<String>,
    pub start_event_id: String,
    pub end_event_id: String,
    pub start_order: i64,
    pub end_order: i64,
    pub merkle_root: String,
    pub record_count: i64,
    pub object_key: String,
    pub object_etag: String,
    pub signer_key_id: String,
    pub signer_signature: String,
    pub uploaded_at: DateTime<Utc>,
}

impl BatchManifest {
    /// Whether the event falls inside this batch's append-order window
    /// (and module, for per-module batches).
    pub fn covers(&self, event: &LedgerEvent) -> bool {
        let in_range = event.append_order >= self.start_order && event.append_order <= self.end_order;
        let in_module = self.module.as_deref().map_or(true, |m| m == event.module);
        in_range && in_module
    }

    pub fn summary(&self) -> String {
        format!(
            "batch {} [{}..{}] {} records, root: {}",
            self.batch_id, self.start_event_id, self.end_event_id, self.record_count, self.merkle_root
        )
    }
}
