#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use audit_ledger::anchor::{AnchorConfig, BatchAnchorer, MemoryObjectStore};
use audit_ledger::canonical::{Canonicalizer, RedactionPolicy, DEFAULT_SENTINEL};
use audit_ledger::crypto::LocalSigner;
use audit_ledger::database::models::IncomingEvent;
use audit_ledger::database::MemoryLedgerStore;
use audit_ledger::ledger::{LedgerWriter, WriterConfig};
use audit_ledger::retry::RetryPolicy;
use audit_ledger::verify::Verifier;
use chrono::Utc;

/// Retry policy with millisecond delays so failure paths finish quickly
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(2),
        jitter_factor: 0.0,
    }
}

/// Create a producer event
pub fn test_event(id: &str, module: &str, payload: serde_json::Value) -> IncomingEvent {
    IncomingEvent {
        id: Some(id.to_string()),
        event_time: Utc::now(),
        event_type: format!("{}.action", module),
        actor_id: "user-42".to_string(),
        actor_role: "admin".to_string(),
        module: module.to_string(),
        payload,
    }
}

/// In-memory ledger with a writer, anchoring and verification wired up
pub struct TestLedger {
    pub store: MemoryLedgerStore,
    pub objects: MemoryObjectStore,
    pub signer: Arc<LocalSigner>,
    pub canonicalizer: Canonicalizer,
    pub writer: LedgerWriter,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::with_policy(RedactionPolicy::default())
    }

    pub fn with_redaction(rules: &[&str]) -> Self {
        Self::with_policy(RedactionPolicy::new(rules, DEFAULT_SENTINEL).unwrap())
    }

    fn with_policy(policy: RedactionPolicy) -> Self {
        let store = MemoryLedgerStore::new();
        let objects = MemoryObjectStore::new();
        let signer = Arc::new(LocalSigner::ephemeral());
        let canonicalizer = Canonicalizer::new(policy);
        let writer = LedgerWriter::new(
            Arc::new(store.clone()),
            signer.clone(),
            canonicalizer.clone(),
            WriterConfig {
                lock_timeout: Duration::from_secs(5),
                sign_policy: fast_retry(),
                append_retry: RetryPolicy {
                    max_attempts: 10,
                    ..fast_retry()
                },
                feed_capacity: 1024,
            },
        );

        Self {
            store,
            objects,
            signer,
            canonicalizer,
            writer,
        }
    }

    pub fn anchorer(&self, batch_size: usize) -> BatchAnchorer {
        self.anchorer_for(batch_size, None)
    }

    pub fn anchorer_for(&self, batch_size: usize, module: Option<&str>) -> BatchAnchorer {
        BatchAnchorer::new(
            Arc::new(self.store.clone()),
            Arc::new(self.objects.clone()),
            self.signer.clone(),
            AnchorConfig {
                batch_size,
                module: module.map(str::to_string),
                object_prefix: "test-ledger".to_string(),
                poll_interval: Duration::from_millis(20),
                sign_policy: fast_retry(),
                upload_policy: fast_retry(),
            },
        )
    }

    /// Verifier with inclusion proofs against the in-memory object store
    pub fn verifier(&self) -> Verifier {
        Verifier::new(
            Arc::new(self.store.clone()),
            self.signer.clone(),
            self.canonicalizer.clone(),
        )
        .with_object_store(Arc::new(self.objects.clone()))
        .with_policy(fast_retry())
    }
}
