use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canonical::{CanonicalRecord, Canonicalizer};
use crate::crypto::{sign_with_retry, SignatureEnvelope, Signer};
use crate::database::models::{IncomingEvent, LedgerEvent, NewLedgerRow};
use crate::database::{AppendTx, LedgerStore};
use crate::error::{LedgerError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Longest wait for the chain tail lock.
    pub lock_timeout: Duration,
    pub sign_policy: RetryPolicy,
    /// Backoff for whole-append retries after retryable failures.
    pub append_retry: RetryPolicy,
    pub feed_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            sign_policy: RetryPolicy::default(),
            append_retry: RetryPolicy::default(),
            feed_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    pub event: LedgerEvent,
    /// The id was already in the ledger with identical content.
    pub already_recorded: bool,
}

/// The ordering authority: gives each event its position in the hash chain.
#[derive(Clone)]
pub struct LedgerWriter {
    store: Arc<dyn LedgerStore>,
    signer: Arc<dyn Signer>,
    canonicalizer: Arc<Canonicalizer>,
    config: WriterConfig,
    feed: broadcast::Sender<LedgerEvent>,
}

impl LedgerWriter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        signer: Arc<dyn Signer>,
        canonicalizer: Canonicalizer,
        config: WriterConfig,
    ) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity.max(1));
        Self {
            store,
            signer,
            canonicalizer: Arc::new(canonicalizer),
            config,
            feed,
        }
    }

    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    /// Newly committed rows, in commit order. Consumers that lag behind the
    /// channel resume from `LedgerStore::events_since`.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.feed.subscribe()
    }

    /// Append one event. A single attempt: retryable failures are returned
    /// to the caller with the chain unchanged.
    pub async fn append(&self, event: &IncomingEvent) -> Result<AppendOutcome> {
        let record = self.canonicalizer.prepare(event)?;
        let record_hash = record.record_hash();

        // The signature covers only the record hash, so it is produced before
        // the tail lock is taken to keep the critical section to read-insert-commit.
        let envelope = sign_with_retry(
            self.signer.as_ref(),
            record_hash.as_bytes(),
            &self.config.sign_policy,
        )
        .await?;

        let mut tx = self.store.begin_append(self.config.lock_timeout).await?;
        match self.append_locked(tx.as_mut(), record, record_hash, envelope).await {
            Ok(outcome) if outcome.already_recorded => {
                tx.rollback().await?;
                Ok(outcome)
            }
            Ok(outcome) => {
                tx.commit().await?;
                debug!(
                    "Appended event {} at position {} ({})",
                    outcome.event.id, outcome.event.append_order, outcome.event.record_hash
                );
                // No subscribers is fine.
                let _ = self.feed.send(outcome.event.clone());
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed append also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn append_locked(
        &self,
        tx: &mut dyn AppendTx,
        record: CanonicalRecord,
        record_hash: String,
        envelope: SignatureEnvelope,
    ) -> Result<AppendOutcome> {
        if let Some(existing) = tx.find_event(&record.id).await? {
            if existing.record_hash == record_hash {
                debug!("Event {} already recorded at {}", existing.id, existing.append_order);
                return Ok(AppendOutcome {
                    event: existing,
                    already_recorded: true,
                });
            }
            return Err(LedgerError::DuplicateEventId(record.id));
        }

        let prev_hash = tx.tail().map(|tail| tail.record_hash.clone());
        let event = tx
            .insert(NewLedgerRow {
                id: record.id,
                event_time: record.event_time,
                event_type: record.event_type,
                actor_id: record.actor_id,
                actor_role: record.actor_role,
                module: record.module,
                payload: record.payload,
                prev_hash,
                record_hash,
                signer_key_id: envelope.key_id,
                signature: envelope.signature,
            })
            .await?;

        Ok(AppendOutcome {
            event,
            already_recorded: false,
        })
    }

    /// Append with bounded retries on contention and signer outages. The
    /// event id is fixed before the first attempt so retries stay idempotent.
    pub async fn append_with_retry(&self, mut event: IncomingEvent) -> Result<AppendOutcome> {
        if event.id.is_none() {
            event.id = Some(Uuid::new_v4().to_string());
        }

        let policy = &self.config.append_retry;
        let mut attempt = 1;
        loop {
            match self.append(&event).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Append of {} failed (attempt {}/{}): {}; retrying in {:?}",
                        event.id.as_deref().unwrap_or_default(),
                        attempt,
                        policy.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Ingest a raw producer message.
    pub async fn append_message(&self, message: &[u8]) -> Result<AppendOutcome> {
        let event = self.canonicalizer.parse_message(message)?;
        let outcome = self.append_with_retry(event).await?;
        if !outcome.already_recorded {
            info!(
                "Recorded {} event {} from {}",
                outcome.event.event_type, outcome.event.id, outcome.event.module
            );
        }
        Ok(outcome)
    }
}
