use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifact::{BatchArtifact, BatchHeader, ARTIFACT_FORMAT_VERSION};
use super::merkle::merkle_root_from_hashes;
use super::object_store::{batch_object_key, content_etag, ObjectMetadata, ObjectStore};
use crate::crypto::{sign_with_retry, Signer};
use crate::database::models::BatchManifest;
use crate::database::{AnchorClaim, LedgerStore, NewBatch};
use crate::error::{LedgerError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub batch_size: usize,
    /// Anchor only this module's events; `None` anchors the global order.
    pub module: Option<String>,
    pub object_prefix: String,
    pub poll_interval: Duration,
    pub sign_policy: RetryPolicy,
    pub upload_policy: RetryPolicy,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            module: None,
            object_prefix: "audit-ledger".to_string(),
            poll_interval: Duration::from_secs(30),
            sign_policy: RetryPolicy::default(),
            upload_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnchorOutcome {
    /// Nothing left to anchor.
    Idle,
    Anchored(BatchManifest),
}

/// Commits windows of unanchored ledger rows to object storage.
pub struct BatchAnchorer {
    store: Arc<dyn LedgerStore>,
    objects: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
    config: AnchorConfig,
}

impl BatchAnchorer {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        objects: Arc<dyn ObjectStore>,
        signer: Arc<dyn Signer>,
        config: AnchorConfig,
    ) -> Self {
        Self {
            store,
            objects,
            signer,
            config,
        }
    }

    pub fn config(&self) -> &AnchorConfig {
        &self.config
    }

    /// One anchoring pass: reconcile orphans, then anchor at most one batch.
    pub async fn run_once(&self) -> Result<AnchorOutcome> {
        self.reconcile().await?;

        let claim = self
            .store
            .claim_unanchored(self.config.batch_size, self.config.module.as_deref())
            .await?;

        if claim.events().is_empty() {
            claim.release().await?;
            debug!("No unanchored events");
            return Ok(AnchorOutcome::Idle);
        }

        let mut claim = claim;
        match self.anchor_claim(claim.as_mut()).await {
            Ok(manifest) => {
                claim.commit().await?;
                info!("Anchored {}", manifest.summary());
                Ok(AnchorOutcome::Anchored(manifest))
            }
            Err(e) => {
                if let Err(release_err) = claim.release().await {
                    warn!("Failed to release anchor claim: {}", release_err);
                }
                Err(e)
            }
        }
    }

    async fn anchor_claim(&self, claim: &mut dyn AnchorClaim) -> Result<BatchManifest> {
        let events = claim.events();
        let (first, last) = match (events.first(), events.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(LedgerError::DatabaseError(
                    "Cannot anchor an empty claim".to_string(),
                ))
            }
        };

        let record_hashes: Vec<String> = events.iter().map(|e| e.record_hash.clone()).collect();
        let merkle_root = merkle_root_from_hashes(&record_hashes)?;
        let root_signature =
            sign_with_retry(self.signer.as_ref(), merkle_root.as_bytes(), &self.config.sign_policy)
                .await?;

        let batch_id = Uuid::new_v4();
        let created_at = Utc::now();
        let object_key = batch_object_key(
            &self.config.object_prefix,
            self.config.module.as_deref(),
            &created_at,
            batch_id,
        );

        let header = BatchHeader {
            format_version: ARTIFACT_FORMAT_VERSION,
            batch_id,
            module: self.config.module.clone(),
            start_event_id: first.id.clone(),
            end_event_id: last.id.clone(),
            start_order: first.append_order,
            end_order: last.append_order,
            record_count: events.len(),
            merkle_root: merkle_root.clone(),
            signer_key_id: root_signature.key_id.clone(),
            root_signature: root_signature.signature.clone(),
            created_at,
        };
        let bytes = BatchArtifact::new(header, events).to_ndjson()?;

        let mut metadata = ObjectMetadata::new();
        metadata.insert("batch-id".to_string(), batch_id.to_string());
        metadata.insert("merkle-root".to_string(), merkle_root.clone());
        metadata.insert("record-count".to_string(), events.len().to_string());
        metadata.insert("signer-key-id".to_string(), root_signature.key_id.clone());

        let object_etag = self.upload_with_retry(&object_key, bytes, &metadata).await?;

        let manifest = claim
            .record_batch(NewBatch {
                batch_id,
                module: self.config.module.clone(),
                merkle_root,
                object_key: object_key.clone(),
                object_etag,
                signer_key_id: root_signature.key_id,
                signer_signature: root_signature.signature,
            })
            .await
            .map_err(|e| {
                warn!(
                    "Artifact {} uploaded but its manifest was not recorded: {}",
                    object_key, e
                );
                e
            })?;

        Ok(manifest)
    }

    async fn upload_with_retry(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        let policy = &self.config.upload_policy;
        let mut attempt = 1;
        let mut saw_transient_failure = false;

        loop {
            let outcome = match tokio::time::timeout(
                policy.attempt_timeout,
                self.objects.put(key, bytes.clone(), metadata),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LedgerError::ObjectStoreUnavailable(format!(
                    "Upload of {} timed out after {:?}",
                    key, policy.attempt_timeout
                ))),
            };

            match outcome {
                Ok(etag) => return Ok(etag),
                // An earlier attempt may have landed before its response was lost.
                Err(LedgerError::ObjectAlreadyExists(_)) if saw_transient_failure => {
                    return self.accept_existing(key, &bytes).await;
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    saw_transient_failure = true;
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Upload attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, policy.max_attempts, key, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A conflicting put after a lost response: the object counts as ours
    /// only if it holds exactly these bytes.
    async fn accept_existing(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let timeout = self.config.upload_policy.attempt_timeout;
        let existing = tokio::time::timeout(timeout, self.objects.get(key))
            .await
            .map_err(|_| {
                LedgerError::ObjectStoreUnavailable(format!(
                    "Reading back {} timed out after {:?}",
                    key, timeout
                ))
            })??;
        match existing {
            Some(existing) if existing == bytes => Ok(content_etag(&existing)),
            Some(_) => Err(LedgerError::ObjectStoreError(format!(
                "Object {} exists with different content",
                key
            ))),
            None => Err(LedgerError::ObjectStoreError(format!(
                "Object {} reported as existing but could not be read",
                key
            ))),
        }
    }

    /// Repair manifests whose rows were never flagged as uploaded. Returns
    /// the number of manifests repaired; an orphan that cannot be matched to
    /// its artifact blocks the run with `OrphanedBatchManifest`.
    pub async fn reconcile(&self) -> Result<usize> {
        let orphans = self.store.orphaned_batches().await?;
        let mut repaired = 0;

        for manifest in orphans {
            match self.repair(&manifest).await {
                Ok(updated) => {
                    warn!(
                        "Repaired orphaned manifest {}: flagged {} events",
                        manifest.batch_id, updated
                    );
                    repaired += 1;
                }
                Err(e @ LedgerError::OrphanedBatchManifest(_)) => {
                    error!(
                        alert = "orphaned_batch_manifest",
                        batch_id = %manifest.batch_id,
                        object_key = %manifest.object_key,
                        "{}",
                        e
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(repaired)
    }

    async fn repair(&self, manifest: &BatchManifest) -> Result<u64> {
        let orphan = |detail: String| {
            LedgerError::OrphanedBatchManifest(format!("{}: {}", manifest.summary(), detail))
        };

        let bytes = self
            .objects
            .get(&manifest.object_key)
            .await?
            .ok_or_else(|| orphan(format!("artifact {} is missing", manifest.object_key)))?;

        let artifact = BatchArtifact::parse(&bytes)
            .map_err(|e| orphan(format!("artifact unreadable: {}", e)))?;
        artifact
            .verify()
            .map_err(|e| orphan(format!("artifact does not verify: {}", e)))?;

        if artifact.header.batch_id != manifest.batch_id
            || artifact.header.merkle_root != manifest.merkle_root
            || artifact.events.len() as i64 != manifest.record_count
        {
            return Err(orphan("artifact header does not match manifest".to_string()));
        }

        for listed in &artifact.events {
            let stored = self
                .store
                .get_event(&listed.id)
                .await?
                .ok_or_else(|| orphan(format!("event {} is not in the ledger", listed.id)))?;

            if stored.record_hash != listed.record_hash || !manifest.covers(&stored) {
                return Err(orphan(format!(
                    "event {} does not match the artifact",
                    listed.id
                )));
            }
            if stored.uploaded
                && stored.anchor_object_key.as_deref() != Some(manifest.object_key.as_str())
            {
                return Err(orphan(format!(
                    "event {} is already anchored in {:?}",
                    listed.id, stored.anchor_object_key
                )));
            }
        }

        self.store
            .mark_anchored(manifest, &artifact.event_ids())
            .await
    }
}

/// Periodic anchoring loop. Runs until the shutdown channel flips to `true`.
pub struct AnchorWorker {
    id: usize,
    anchorer: Arc<BatchAnchorer>,
    shutdown: watch::Receiver<bool>,
}

impl AnchorWorker {
    pub fn new(id: usize, anchorer: Arc<BatchAnchorer>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id,
            anchorer,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let config = self.anchorer.config().clone();
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Anchor worker {} started (batch size {}, interval {:?})",
            self.id, config.batch_size, config.poll_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Keep going while batches come back full.
            loop {
                if *self.shutdown.borrow() {
                    break;
                }
                match self.anchorer.run_once().await {
                    Ok(AnchorOutcome::Anchored(manifest))
                        if manifest.record_count as usize >= config.batch_size =>
                    {
                        continue
                    }
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => {
                        warn!("Anchor worker {}: run failed, will retry: {}", self.id, e);
                        break;
                    }
                    Err(e) => {
                        error!("Anchor worker {}: run failed: {}", self.id, e);
                        break;
                    }
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
        }

        info!("Anchor worker {} stopped", self.id);
    }
}

pub fn spawn_anchor_workers(
    anchorer: Arc<BatchAnchorer>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|id| tokio::spawn(AnchorWorker::new(id, anchorer.clone(), shutdown.clone()).run()))
        .collect()
}
