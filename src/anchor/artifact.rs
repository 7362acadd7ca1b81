//! Batch artifact format
//!
//! Newline-delimited JSON. The first line is the batch header carrying the
//! signed Merkle root, followed by one line per event in append order. Every
//! line is self-describing through its `kind` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::merkle::verify_merkle_root;
use crate::canonical::CanonicalRecord;
use crate::database::models::LedgerEvent;
use crate::error::{LedgerError, Result};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub format_version: u32,
    pub batch_id: Uuid,
    pub module: Option<String>,
    pub start_event_id: String,
    pub end_event_id: String,
    pub start_order: i64,
    pub end_order: i64,
    pub record_count: usize,
    pub merkle_root: String,
    pub signer_key_id: String,
    pub root_signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub append_order: i64,
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

impl From<&LedgerEvent> for ArtifactEvent {
    fn from(event: &LedgerEvent) -> Self {
        Self {
            append_order: event.append_order,
            id: event.id.clone(),
            event_time: event.event_time,
            event_type: event.event_type.clone(),
            actor_id: event.actor_id.clone(),
            actor_role: event.actor_role.clone(),
            module: event.module.clone(),
            payload: event.payload.clone(),
            prev_hash: event.prev_hash.clone(),
            record_hash: event.record_hash.clone(),
            signer_key_id: event.signer_key_id.clone(),
            signature: event.signature.clone(),
        }
    }
}

impl ArtifactEvent {
    pub fn canonical_record(&self) -> CanonicalRecord {
        CanonicalRecord {
            id: self.id.clone(),
            event_time: self.event_time,
            event_type: self.event_type.clone(),
            actor_id: self.actor_id.clone(),
            actor_role: self.actor_role.clone(),
            module: self.module.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ArtifactLine {
    Batch(BatchHeader),
    Event(ArtifactEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchArtifact {
    pub header: BatchHeader,
    pub events: Vec<ArtifactEvent>,
}

impl BatchArtifact {
    pub fn new(header: BatchHeader, events: &[LedgerEvent]) -> Self {
        Self {
            header,
            events: events.iter().map(ArtifactEvent::from).collect(),
        }
    }

    pub fn to_ndjson(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(256 * (self.events.len() + 1));
        serde_json::to_writer(&mut out, &ArtifactLine::Batch(self.header.clone()))?;
        out.push(b'\n');
        for event in &self.events {
            serde_json::to_writer(&mut out, &ArtifactLine::Event(event.clone()))?;
            out.push(b'\n');
        }
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| LedgerError::ObjectStoreError(format!("Artifact is not UTF-8: {}", e)))?;

        let mut header = None;
        let mut events = Vec::new();

        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ArtifactLine = serde_json::from_str(line).map_err(|e| {
                LedgerError::ObjectStoreError(format!(
                    "Malformed artifact line {}: {}",
                    line_no + 1,
                    e
                ))
            })?;
            match parsed {
                ArtifactLine::Batch(h) if header.is_none() && events.is_empty() => header = Some(h),
                ArtifactLine::Batch(_) => {
                    return Err(LedgerError::ObjectStoreError(format!(
                        "Unexpected batch header on line {}",
                        line_no + 1
                    )))
                }
                ArtifactLine::Event(e) => events.push(e),
            }
        }

        let header = header.ok_or_else(|| {
            LedgerError::ObjectStoreError("Artifact has no batch header".to_string())
        })?;
        if header.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(LedgerError::ObjectStoreError(format!(
                "Unsupported artifact format version {}",
                header.format_version
            )));
        }

        Ok(Self { header, events })
    }

    pub fn record_hashes(&self) -> Vec<String> {
        self.events.iter().map(|e| e.record_hash.clone()).collect()
    }

    pub fn position_of(&self, record_hash: &str) -> Option<usize> {
        self.events.iter().position(|e| e.record_hash == record_hash)
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    /// Recompute each listed record hash and the Merkle root over them.
    pub fn verify(&self) -> Result<()> {
        if self.events.len() != self.header.record_count {
            return Err(LedgerError::tamper(
                &self.header.batch_id.to_string(),
                format!(
                    "artifact lists {} events, header claims {}",
                    self.events.len(),
                    self.header.record_count
                ),
            ));
        }

        for event in &self.events {
            let recomputed = event.canonical_record().record_hash();
            if recomputed != event.record_hash {
                return Err(LedgerError::tamper(
                    &event.id,
                    format!("artifact record hash {} recomputes to {}", event.record_hash, recomputed),
                ));
            }
        }

        if !verify_merkle_root(&self.record_hashes(), &self.header.merkle_root)? {
            return Err(LedgerError::tamper(
                &self.header.batch_id.to_string(),
                format!(
                    "artifact root {} does not match its listed hashes",
                    self.header.merkle_root
                ),
            ));
        }
        Ok(())
    }
}
