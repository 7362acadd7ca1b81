//! Batch Anchoring Tests
//!
//! Crash recovery between artifact upload and row flagging, and upload
//! retries whose first attempt landed before its response was lost, and the
//! stored artifact root across batch sizes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use audit_ledger::anchor::artifact::ARTIFACT_FORMAT_VERSION;
use audit_ledger::anchor::object_store::{batch_object_key, content_etag, ObjectMetadata};
use audit_ledger::anchor::{
    merkle_root_from_hashes, AnchorConfig, AnchorOutcome, BatchAnchorer, BatchArtifact,
    BatchHeader, MemoryObjectStore, ObjectStore,
};
use audit_ledger::crypto::Signer;
use audit_ledger::database::models::{BatchManifest, LedgerEvent};
use audit_ledger::database::LedgerStore;
use audit_ledger::error::{LedgerError, Result};
use audit_ledger::verify::VerificationStatus;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

mod common;
use common::*;

async fn append_events(ledger: &TestLedger, count: usize) -> Vec<LedgerEvent> {
    let mut events = Vec::new();
    for i in 1..=count {
        let outcome = ledger
            .writer
            .append(&test_event(&format!("evt-{}", i), "auth", json!({"attempt": i})))
            .await
            .unwrap();
        events.push(outcome.event);
    }
    events
}

/// Build the manifest a crashed anchorer would have left behind, optionally
/// uploading its artifact first.
async fn leave_orphan(ledger: &TestLedger, events: &[LedgerEvent], upload: bool) -> BatchManifest {
    let hashes: Vec<String> = events.iter().map(|e| e.record_hash.clone()).collect();
    let merkle_root = merkle_root_from_hashes(&hashes).unwrap();
    let root_signature = ledger.signer.sign(merkle_root.as_bytes()).await.unwrap();

    let batch_id = Uuid::new_v4();
    let created_at = Utc::now();
    let object_key = batch_object_key("test-ledger", None, &created_at, batch_id);
    let first = events.first().unwrap();
    let last = events.last().unwrap();

    let header = BatchHeader {
        format_version: ARTIFACT_FORMAT_VERSION,
        batch_id,
        module: None,
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
    let bytes = BatchArtifact::new(header, events).to_ndjson().unwrap();
    let object_etag = content_etag(&bytes);
    if upload {
        ledger
            .objects
            .put(&object_key, bytes, &ObjectMetadata::new())
            .await
            .unwrap();
    }

    let manifest = BatchManifest {
        batch_id,
        module: None,
        start_event_id: first.id.clone(),
        end_event_id: last.id.clone(),
        start_order: first.append_order,
        end_order: last.append_order,
        merkle_root,
        record_count: events.len() as i64,
        object_key,
        object_etag,
        signer_key_id: root_signature.key_id,
        signer_signature: root_signature.signature,
        uploaded_at: created_at,
    };
    ledger
        .store
        .insert_manifest_unchecked(manifest.clone())
        .unwrap();
    manifest
}

#[tokio::test]
async fn test_orphaned_manifest_is_repaired_from_artifact() {
    let ledger = TestLedger::new();
    let events = append_events(&ledger, 3).await;
    let manifest = leave_orphan(&ledger, &events, true).await;

    assert_eq!(ledger.store.orphaned_batches().await.unwrap().len(), 1);

    // Repair flags the rows; nothing is left to anchor afterwards.
    let outcome = ledger.anchorer(10).run_once().await.unwrap();
    assert!(matches!(outcome, AnchorOutcome::Idle));
    assert!(ledger.store.orphaned_batches().await.unwrap().is_empty());
    assert_eq!(ledger.store.list_batches(10).await.unwrap().len(), 1);

    let verifier = ledger.verifier();
    for event in &events {
        let stored = ledger.store.get_event(&event.id).await.unwrap().unwrap();
        assert!(stored.uploaded);
        assert_eq!(stored.anchor_object_key.as_deref(), Some(manifest.object_key.as_str()));

        let report = verifier.verify(&event.id).await.unwrap();
        assert_eq!(report.status(), VerificationStatus::Verified, "{}", report.summary());
        assert_eq!(report.batch_id, Some(manifest.batch_id));
    }
}

#[tokio::test]
async fn test_orphan_without_artifact_blocks_anchoring() {
    let ledger = TestLedger::new();
    let events = append_events(&ledger, 2).await;
    leave_orphan(&ledger, &events, false).await;

    match ledger.anchorer(10).run_once().await {
        Err(LedgerError::OrphanedBatchManifest(detail)) => assert!(detail.contains("missing")),
        other => panic!("expected OrphanedBatchManifest, got {:?}", other),
    }

    // No second batch over the same rows, and the rows stay unflagged.
    assert_eq!(ledger.store.list_batches(10).await.unwrap().len(), 1);
    for event in &events {
        let stored = ledger.store.get_event(&event.id).await.unwrap().unwrap();
        assert!(!stored.uploaded);
    }
    assert!(ledger.objects.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_orphan_with_mismatched_artifact_is_not_repaired() {
    let ledger = TestLedger::new();
    let events = append_events(&ledger, 2).await;
    let manifest = leave_orphan(&ledger, &events, true).await;

    // The artifact lists a different payload than the ledger row.
    let bytes = ledger.objects.get(&manifest.object_key).await.unwrap().unwrap();
    let mut artifact = BatchArtifact::parse(&bytes).unwrap();
    artifact.events[1].record_hash = artifact.events[0].record_hash.clone();
    ledger
        .objects
        .overwrite_unchecked(&manifest.object_key, artifact.to_ndjson().unwrap())
        .unwrap();

    let result = ledger.anchorer(10).reconcile().await;
    assert!(matches!(result, Err(LedgerError::OrphanedBatchManifest(_))));
    let stored = ledger.store.get_event("evt-1").await.unwrap().unwrap();
    assert!(!stored.uploaded);
}

/// Stores the first upload but reports it as a lost response.
#[derive(Clone, Default)]
struct LostResponseStore {
    inner: MemoryObjectStore,
    puts: Arc<AtomicUsize>,
}

#[async_trait]
impl ObjectStore for LostResponseStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &ObjectMetadata) -> Result<String> {
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst);
        let etag = self.inner.put(key, bytes, metadata).await?;
        if attempt == 0 {
            return Err(LedgerError::ObjectStoreUnavailable(
                "connection reset".to_string(),
            ));
        }
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
}

#[tokio::test]
async fn test_upload_retry_accepts_identical_existing_object() {
    let ledger = TestLedger::new();
    append_events(&ledger, 4).await;

    let objects = LostResponseStore::default();
    let anchorer = BatchAnchorer::new(
        Arc::new(ledger.store.clone()),
        Arc::new(objects.clone()),
        ledger.signer.clone(),
        AnchorConfig {
            batch_size: 10,
            module: None,
            object_prefix: "test-ledger".to_string(),
            poll_interval: std::time::Duration::from_millis(20),
            sign_policy: fast_retry(),
            upload_policy: fast_retry(),
        },
    );

    let manifest = match anchorer.run_once().await.unwrap() {
        AnchorOutcome::Anchored(manifest) => manifest,
        AnchorOutcome::Idle => panic!("expected a batch"),
    };
    assert_eq!(objects.puts.load(Ordering::SeqCst), 2);
    assert_eq!(manifest.record_count, 4);
    assert_eq!(objects.inner.keys().unwrap(), vec![manifest.object_key.clone()]);

    let stored = objects.inner.get(&manifest.object_key).await.unwrap().unwrap();
    assert_eq!(manifest.object_etag, content_etag(&stored));
}

#[tokio::test]
async fn test_anchored_artifact_carries_signed_root() {
    let ledger = TestLedger::new();
    append_events(&ledger, 5).await;

    let manifest = match ledger.anchorer(3).run_once().await.unwrap() {
        AnchorOutcome::Anchored(manifest) => manifest,
        AnchorOutcome::Idle => panic!("expected a batch"),
    };
    assert_eq!(manifest.start_event_id, "evt-1");
    assert_eq!(manifest.end_event_id, "evt-3");

    let bytes = ledger.objects.get(&manifest.object_key).await.unwrap().unwrap();
    let artifact = BatchArtifact::parse(&bytes).unwrap();
    artifact.verify().unwrap();
    assert_eq!(artifact.header.merkle_root, manifest.merkle_root);
    assert!(ledger
        .signer
        .verify(
            artifact.header.merkle_root.as_bytes(),
            &artifact.header.root_signature,
            &artifact.header.signer_key_id,
        )
        .await
        .unwrap());

    let metadata = ledger.objects.metadata(&manifest.object_key).unwrap().unwrap();
    assert_eq!(metadata.get("merkle-root"), Some(&manifest.merkle_root));
    assert_eq!(metadata.get("record-count").map(String::as_str), Some("3"));

    // Remaining rows go into the next window, linked by append order.
    let next = match ledger.anchorer(3).run_once().await.unwrap() {
        AnchorOutcome::Anchored(manifest) => manifest,
        AnchorOutcome::Idle => panic!("expected a second batch"),
    };
    assert_eq!(next.start_order, manifest.end_order + 1);
    assert_eq!(next.record_count, 2);
    assert!(matches!(
        ledger.anchorer(3).run_once().await.unwrap(),
        AnchorOutcome::Idle
    ));
}

#[tokio::test]
async fn test_stored_artifact_root_matches_manifest_for_batch_sizes() {
    for k in [1usize, 2, 3, 7, 1000] {
        let ledger = TestLedger::new();
        let events = append_events(&ledger, k).await;

        let manifest = match ledger.anchorer(k).run_once().await.unwrap() {
            AnchorOutcome::Anchored(manifest) => manifest,
            AnchorOutcome::Idle => panic!("expected a batch of {}", k),
        };
        assert_eq!(manifest.record_count, k as i64);
        assert_eq!(manifest.start_event_id, events[0].id);
        assert_eq!(manifest.end_event_id, events[k - 1].id);

        let bytes = ledger.objects.get(&manifest.object_key).await.unwrap().unwrap();
        let artifact = BatchArtifact::parse(&bytes).unwrap();
        assert_eq!(artifact.events.len(), k);
        assert_eq!(artifact.header.record_count, k);

        let expected: Vec<String> = events.iter().map(|e| e.record_hash.clone()).collect();
        assert_eq!(artifact.record_hashes(), expected);

        let recomputed = merkle_root_from_hashes(&artifact.record_hashes()).unwrap();
        assert_eq!(recomputed, manifest.merkle_root, "batch of {}", k);
        assert_eq!(artifact.header.merkle_root, manifest.merkle_root);
        artifact.verify().unwrap();

        assert!(matches!(
            ledger.anchorer(k).run_once().await.unwrap(),
            AnchorOutcome::Idle
        ));
    }
}
