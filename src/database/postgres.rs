use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{BatchManifest, ChainTail, LedgerEvent, NewLedgerRow};
use super::{AnchorClaim, AppendTx, LedgerStore, NewBatch};
use crate::canonical::{payload_from_text, payload_to_text};
use crate::error::{LedgerError, Result};

const EVENT_COLUMNS: &str = "append_order, event_id, event_time, event_type, actor_id, actor_role, \
     module, payload, prev_hash, record_hash, signer_key_id, signature, uploaded, \
     anchor_object_key, recorded_at";

const BATCH_COLUMNS: &str = "batch_id, module, start_event_id, end_event_id, start_order, end_order, \
     merkle_root, record_count, object_key, object_etag, signer_key_id, signer_signature, uploaded_at";

/// SQLSTATE codes that mean "lost the race for a lock"
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Ledger schema migrations applied");
        Ok(())
    }
}

fn map_lock_error(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code();
        match code.as_deref() {
            Some(LOCK_NOT_AVAILABLE) | Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                return LedgerError::ChainContentionTimeout(db_err.message().to_string());
            }
            _ => {}
        }
    }
    LedgerError::from(err)
}

fn map_insert_error(err: sqlx::Error, event_id: &str) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return LedgerError::DuplicateEventId(event_id.to_string());
        }
    }
    map_lock_error(err)
}

fn event_from_row(row: &PgRow) -> Result<LedgerEvent> {
    let payload: String = row.try_get("payload")?;
    Ok(LedgerEvent {
        append_order: row.try_get("append_order")?,
        id: row.try_get("event_id")?,
        event_time: row.try_get("event_time")?,
        event_type: row.try_get("event_type")?,
        actor_id: row.try_get("actor_id")?,
        actor_role: row.try_get("actor_role")?,
        module: row.try_get("module")?,
        payload: payload_from_text(&payload)?,
        prev_hash: row.try_get("prev_hash")?,
        record_hash: row.try_get("record_hash")?,
        signer_key_id: row.try_get("signer_key_id")?,
        signature: row.try_get("signature")?,
        uploaded: row.try_get("uploaded")?,
        anchor_object_key: row.try_get("anchor_object_key")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<BatchManifest> {
    Ok(BatchManifest {
        batch_id: row.try_get("batch_id")?,
        module: row.try_get("module")?,
        start_event_id: row.try_get("start_event_id")?,
        end_event_id: row.try_get("end_event_id")?,
        start_order: row.try_get("start_order")?,
        end_order: row.try_get("end_order")?,
        merkle_root: row.try_get("merkle_root")?,
        record_count: row.try_get("record_count")?,
        object_key: row.try_get("object_key")?,
        object_etag: row.try_get("object_etag")?,
        signer_key_id: row.try_get("signer_key_id")?,
        signer_signature: row.try_get("signer_signature")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin_append(&self, lock_timeout: Duration) -> Result<Box<dyn AppendTx>> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters; the value is an integer we format.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await?;

        let head = sqlx::query(
            "SELECT last_append_order, head_hash FROM ledger_head WHERE id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(map_lock_error)?;

        let last_append_order: i64 = head.try_get("last_append_order")?;
        let head_hash: Option<String> = head.try_get("head_hash")?;
        let tail = head_hash.map(|record_hash| ChainTail {
            append_order: last_append_order,
            record_hash,
        });

        Ok(Box::new(PgAppendTx {
            tx,
            tail,
            next_order: last_append_order + 1,
        }))
    }

    async fn claim_unanchored(
        &self,
        limit: usize,
        module: Option<&str>,
    ) -> Result<Box<dyn AnchorClaim>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_events \
             WHERE uploaded = FALSE AND ($2::TEXT IS NULL OR module = $2) \
             ORDER BY append_order LIMIT $1 FOR UPDATE SKIP LOCKED",
            EVENT_COLUMNS
        ))
        .bind(limit as i64)
        .bind(module)
        .fetch_all(&mut *tx)
        .await?;

        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        debug!("Claimed {} unanchored events", events.len());

        Ok(Box::new(PgAnchorClaim {
            tx,
            events,
            staged: None,
        }))
    }

    async fn get_event(&self, id: &str) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn events_since(&self, after_order: i64, limit: usize) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_events WHERE append_order > $1 ORDER BY append_order LIMIT $2",
            EVENT_COLUMNS
        ))
        .bind(after_order)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn chain_head(&self) -> Result<Option<ChainTail>> {
        let row = sqlx::query("SELECT last_append_order, head_hash FROM ledger_head WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let head_hash: Option<String> = row.try_get("head_hash")?;
        let last_append_order: i64 = row.try_get("last_append_order")?;
        Ok(head_hash.map(|record_hash| ChainTail {
            append_order: last_append_order,
            record_hash,
        }))
    }

    async fn batches_for_object_key(&self, object_key: &str) -> Result<Vec<BatchManifest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_batches WHERE object_key = $1 ORDER BY uploaded_at DESC",
            BATCH_COLUMNS
        ))
        .bind(object_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn batch_by_id(&self, batch_id: Uuid) -> Result<Option<BatchManifest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_batches WHERE batch_id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<BatchManifest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_batches ORDER BY uploaded_at DESC LIMIT $1",
            BATCH_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn orphaned_batches(&self) -> Result<Vec<BatchManifest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_batches b WHERE EXISTS ( \
                SELECT 1 FROM ledger_events e \
                WHERE e.append_order BETWEEN b.start_order AND b.end_order \
                  AND (b.module IS NULL OR e.module = b.module) \
                  AND e.uploaded = FALSE) \
             ORDER BY b.uploaded_at",
            BATCH_COLUMNS
                .split(", ")
                .map(|c| format!("b.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn mark_anchored(&self, batch: &BatchManifest, event_ids: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE ledger_events SET uploaded = TRUE, anchor_object_key = $1 \
             WHERE event_id = ANY($2) AND uploaded = FALSE",
        )
        .bind(&batch.object_key)
        .bind(event_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

struct PgAppendTx {
    tx: Transaction<'static, Postgres>,
    tail: Option<ChainTail>,
    next_order: i64,
}

#[async_trait]
impl AppendTx for PgAppendTx {
    fn tail(&self) -> Option<&ChainTail> {
        self.tail.as_ref()
    }

    async fn find_event(&mut self, id: &str) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert(&mut self, row: NewLedgerRow) -> Result<LedgerEvent> {
        let append_order = self.next_order;
        let recorded_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_events
                (append_order, event_id, event_time, event_type, actor_id, actor_role, module,
                 payload, prev_hash, record_hash, signer_key_id, signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING recorded_at
            "#,
        )
        .bind(append_order)
        .bind(&row.id)
        .bind(row.event_time)
        .bind(&row.event_type)
        .bind(&row.actor_id)
        .bind(&row.actor_role)
        .bind(&row.module)
        .bind(payload_to_text(&row.payload))
        .bind(&row.prev_hash)
        .bind(&row.record_hash)
        .bind(&row.signer_key_id)
        .bind(&row.signature)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_insert_error(e, &row.id))?;

        sqlx::query("UPDATE ledger_head SET last_append_order = $1, head_hash = $2 WHERE id = 1")
            .bind(append_order)
            .bind(&row.record_hash)
            .execute(&mut *self.tx)
            .await?;

        self.next_order += 1;

        Ok(LedgerEvent {
            append_order,
            id: row.id,
            event_time: row.event_time,
            event_type: row.event_type,
            actor_id: row.actor_id,
            actor_role: row.actor_role,
            module: row.module,
            payload: row.payload,
            prev_hash: row.prev_hash,
            record_hash: row.record_hash,
            signer_key_id: row.signer_key_id,
            signature: row.signature,
            uploaded: false,
            anchor_object_key: None,
            recorded_at,
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_lock_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

struct PgAnchorClaim {
    tx: Transaction<'static, Postgres>,
    events: Vec<LedgerEvent>,
    staged: Option<BatchManifest>,
}

#[async_trait]
impl AnchorClaim for PgAnchorClaim {
    fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    async fn record_batch(&mut self, batch: NewBatch) -> Result<BatchManifest> {
        let (first, last) = match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => {
                return Err(LedgerError::DatabaseError(
                    "Cannot record a batch for an empty claim".to_string(),
                ))
            }
        };
        let record_count = self.events.len() as i64;

        let uploaded_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_batches
                (batch_id, module, start_event_id, end_event_id, start_order, end_order,
                 merkle_root, record_count, object_key, object_etag, signer_key_id, signer_signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING uploaded_at
            "#,
        )
        .bind(batch.batch_id)
        .bind(&batch.module)
        .bind(&first.id)
        .bind(&last.id)
        .bind(first.append_order)
        .bind(last.append_order)
        .bind(&batch.merkle_root)
        .bind(record_count)
        .bind(&batch.object_key)
        .bind(&batch.object_etag)
        .bind(&batch.signer_key_id)
        .bind(&batch.signer_signature)
        .fetch_one(&mut *self.tx)
        .await?;

        let orders: Vec<i64> = self.events.iter().map(|e| e.append_order).collect();
        let updated = sqlx::query(
            "UPDATE ledger_events SET uploaded = TRUE, anchor_object_key = $1 \
             WHERE append_order = ANY($2) AND uploaded = FALSE",
        )
        .bind(&batch.object_key)
        .bind(&orders)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if updated != orders.len() as u64 {
            return Err(LedgerError::DatabaseError(format!(
                "Expected to anchor {} events, updated {}",
                orders.len(),
                updated
            )));
        }

        let manifest = BatchManifest {
            batch_id: batch.batch_id,
            module: batch.module,
            start_event_id: first.id,
            end_event_id: last.id,
            start_order: first.append_order,
            end_order: last.append_order,
            merkle_root: batch.merkle_root,
            record_count,
            object_key: batch.object_key,
            object_etag: batch.object_etag,
            signer_key_id: batch.signer_key_id,
            signer_signature: batch.signer_signature,
            uploaded_at,
        };
        self.staged = Some(manifest.clone());
        Ok(manifest)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
