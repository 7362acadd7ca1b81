//! Ledger Verification
//!
//! Read-only checks over committed rows: per-event recomputation, signature
//! and batch lookup with an optional Merkle inclusion proof against the
//! stored artifact, plus a full walk of the hash chain.

pub mod chain;

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anchor::artifact::BatchArtifact;
use crate::anchor::merkle::generate_proof;
use crate::anchor::object_store::ObjectStore;
use crate::canonical::Canonicalizer;
use crate::crypto::{verify_with_timeout, Signer};
use crate::database::models::{BatchManifest, LedgerEvent};
use crate::database::LedgerStore;
use crate::error::{LedgerError, Result};
use crate::retry::RetryPolicy;

pub use chain::{BrokenLink, ChainReport, LinkIssue};
use chain::ChainWalker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationStatus {
    /// Hash, signature and anchor all check out.
    Verified,
    /// Hash and signature check out; not yet committed to a batch.
    PendingAnchor,
    TamperDetected,
    /// Row and manifest disagree (flagged uploaded without a matching batch).
    Inconsistent,
    /// A collaborator was unreachable; nothing failed.
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub event_id: String,
    pub append_order: i64,
    pub hash_ok: bool,
    /// `None` when the signer could not be reached.
    pub signature_ok: Option<bool>,
    pub anchored: bool,
    pub batch_found: bool,
    pub anchor_object_key: Option<String>,
    pub batch_id: Option<Uuid>,
    /// `None` when no proof was attempted or storage was unreachable.
    pub inclusion_ok: Option<bool>,
    /// A check was skipped because a collaborator was unreachable.
    pub inconclusive: bool,
    pub notes: Vec<String>,
}

impl VerificationReport {
    pub fn status(&self) -> VerificationStatus {
        if !self.hash_ok
            || self.signature_ok == Some(false)
            || self.inclusion_ok == Some(false)
        {
            return VerificationStatus::TamperDetected;
        }
        if self.anchored && !self.batch_found {
            return VerificationStatus::Inconsistent;
        }
        if self.inconclusive || self.signature_ok.is_none() {
            return VerificationStatus::Inconclusive;
        }
        if !self.anchored {
            return VerificationStatus::PendingAnchor;
        }
        VerificationStatus::Verified
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{:?}] hash_ok={} signature_ok={:?} batch_found={} inclusion_ok={:?}",
            self.event_id,
            self.status(),
            self.hash_ok,
            self.signature_ok,
            self.batch_found,
            self.inclusion_ok
        )
    }
}

pub struct Verifier {
    store: Arc<dyn LedgerStore>,
    signer: Arc<dyn Signer>,
    canonicalizer: Canonicalizer,
    objects: Option<Arc<dyn ObjectStore>>,
    policy: RetryPolicy,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        signer: Arc<dyn Signer>,
        canonicalizer: Canonicalizer,
    ) -> Self {
        Self {
            store,
            signer,
            canonicalizer,
            objects: None,
            policy: RetryPolicy::default(),
        }
    }

    /// Enable inclusion proofs against stored artifacts.
    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn verify(&self, event_id: &str) -> Result<VerificationReport> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| LedgerError::EventNotFound(event_id.to_string()))?;

        let mut notes = Vec::new();
        let mut inconclusive = false;

        let recomputed = self.canonicalizer.recompute_hash(&event);
        let hash_ok = recomputed == event.record_hash;
        if !hash_ok {
            notes.push(format!(
                "record hash {} recomputes to {}",
                event.record_hash, recomputed
            ));
        }

        // The signature is checked against the recomputed hash: a row whose
        // content and hash were both rewritten still fails here.
        let signature_ok = match verify_with_timeout(
            self.signer.as_ref(),
            recomputed.as_bytes(),
            &event.signature,
            &event.signer_key_id,
            &self.policy,
        )
        .await
        {
            Ok(valid) => {
                if !valid {
                    notes.push(format!("signature by {} does not verify", event.signer_key_id));
                }
                Some(valid)
            }
            Err(e) => {
                notes.push(format!("signature not checked: {}", e));
                None
            }
        };

        let anchored = event.uploaded || event.anchor_object_key.is_some();
        let manifest = self.find_manifest(&event, &mut notes).await?;

        let inclusion_ok = match (&manifest, &self.objects) {
            (Some(manifest), Some(objects)) => {
                match self.check_inclusion(&event, manifest, objects.as_ref()).await {
                    Ok(result) => {
                        if let Err(detail) = &result {
                            notes.push(detail.clone());
                        }
                        Some(result.is_ok())
                    }
                    Err(e) => {
                        inconclusive = true;
                        notes.push(format!("inclusion proof not checked: {}", e));
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(VerificationReport {
            event_id: event.id.clone(),
            append_order: event.append_order,
            hash_ok,
            signature_ok,
            anchored,
            batch_found: manifest.is_some(),
            anchor_object_key: event.anchor_object_key.clone(),
            batch_id: manifest.map(|m| m.batch_id),
            inclusion_ok,
            inconclusive,
            notes,
        })
    }

    /// The most recent manifest for the row's object key that covers the row.
    async fn find_manifest(
        &self,
        event: &LedgerEvent,
        notes: &mut Vec<String>,
    ) -> Result<Option<BatchManifest>> {
        let Some(key) = &event.anchor_object_key else {
            if event.uploaded {
                notes.push("flagged uploaded without an object key".to_string());
            }
            return Ok(None);
        };

        let manifests = self.store.batches_for_object_key(key).await?;
        if manifests.len() > 1 {
            warn!(
                "{} manifests reference {}; using the most recent",
                manifests.len(),
                key
            );
        }
        let found = manifests.into_iter().find(|m| m.covers(event));
        if found.is_none() {
            notes.push(format!("no batch manifest for {} covers this event", key));
        }
        Ok(found)
    }

    /// Outer error: storage unreachable. Inner error: the proof failed.
    async fn check_inclusion(
        &self,
        event: &LedgerEvent,
        manifest: &BatchManifest,
        objects: &dyn ObjectStore,
    ) -> Result<std::result::Result<(), String>> {
        let Some(bytes) = objects.get(&manifest.object_key).await? else {
            return Ok(Err(format!("artifact {} is missing", manifest.object_key)));
        };

        let artifact = match BatchArtifact::parse(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => return Ok(Err(format!("artifact unreadable: {}", e))),
        };
        if artifact.header.merkle_root != manifest.merkle_root {
            return Ok(Err("artifact root differs from manifest root".to_string()));
        }

        let hashes = artifact.record_hashes();
        let Some(position) = artifact.position_of(&event.record_hash) else {
            return Ok(Err("record hash not listed in artifact".to_string()));
        };
        // Malformed hashes in the artifact fail the proof; they are not an outage.
        let reaches_root = generate_proof(&hashes, position)
            .and_then(|proof| proof.verify_against(&manifest.merkle_root));
        match reaches_root {
            Ok(true) => {}
            Ok(false) => {
                return Ok(Err("Merkle path does not reach the manifest root".to_string()))
            }
            Err(e) => return Ok(Err(format!("Merkle proof could not be built: {}", e))),
        }

        let root_signed = verify_with_timeout(
            self.signer.as_ref(),
            manifest.merkle_root.as_bytes(),
            &manifest.signer_signature,
            &manifest.signer_key_id,
            &self.policy,
        )
        .await?;
        if !root_signed {
            return Ok(Err("batch root signature does not verify".to_string()));
        }

        Ok(Ok(()))
    }

    /// Verify and escalate: tamper and inconsistency statuses are logged as
    /// alerts and returned as `TamperDetected`.
    pub async fn verify_or_alert(&self, event_id: &str) -> Result<VerificationReport> {
        let report = self.verify(event_id).await?;
        match report.status() {
            VerificationStatus::TamperDetected | VerificationStatus::Inconsistent => {
                error!(
                    alert = "ledger_tamper_detected",
                    event_id = %report.event_id,
                    "{}",
                    report.summary()
                );
                Err(LedgerError::tamper(&report.event_id, report.notes.join("; ")))
            }
            _ => Ok(report),
        }
    }

    /// Walk the whole ledger in append order, checking every link and hash.
    pub async fn verify_chain(&self, page_size: usize) -> Result<ChainReport> {
        let page_size = page_size.max(1);
        let mut walker = ChainWalker::new(&self.canonicalizer);

        loop {
            let page = self.store.events_since(walker.last_order(), page_size).await?;
            if page.is_empty() {
                break;
            }
            page.iter().for_each(|event| walker.push(event));
            if page.len() < page_size {
                break;
            }
        }

        let head = self.store.chain_head().await?;
        let report = walker.finish(head.as_ref().map(|h| h.record_hash.as_str()));
        if report.is_valid() {
            info!("{}", report.summary());
        } else {
            error!(alert = "ledger_chain_broken", "{}", report.summary());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> VerificationReport {
        VerificationReport {
            event_id: "e".to_string(),
            append_order: 1,
            hash_ok: true,
            signature_ok: Some(true),
            anchored: true,
            batch_found: true,
            anchor_object_key: Some("k".to_string()),
            batch_id: Some(Uuid::nil()),
            inclusion_ok: None,
            inconclusive: false,
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_status_precedence() {
        assert_eq!(report().status(), VerificationStatus::Verified);

        let pending = VerificationReport {
            anchored: false,
            batch_found: false,
            ..report()
        };
        assert_eq!(pending.status(), VerificationStatus::PendingAnchor);

        let missing_batch = VerificationReport {
            batch_found: false,
            ..report()
        };
        assert_eq!(missing_batch.status(), VerificationStatus::Inconsistent);

        let unreachable = VerificationReport {
            signature_ok: None,
            ..report()
        };
        assert_eq!(unreachable.status(), VerificationStatus::Inconclusive);

        let tampered = VerificationReport {
            hash_ok: false,
            signature_ok: None,
            ..report()
        };
        assert_eq!(tampered.status(), VerificationStatus::TamperDetected);

        let bad_proof = VerificationReport {
            inclusion_ok: Some(false),
            ..report()
        };
        assert_eq!(bad_proof.status(), VerificationStatus::TamperDetected);
    }
}
