//! Ledger Storage
//!
//! The ledger table and the batch manifest table are the only shared mutable
//! state. Both backends expose the same two write paths:
//!
//! - an exclusive append transaction that holds the chain tail lock from the
//!   moment the tail is read until commit or rollback, and
//! - an anchor claim over not-yet-uploaded rows that other claims skip.

pub mod memory;
pub mod models;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use models::{BatchManifest, ChainTail, LedgerEvent, NewLedgerRow};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Manifest fields produced by the anchorer before it is recorded.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_id: Uuid,
    pub module: Option<String>,
    pub merkle_root: String,
    pub object_key: String,
    pub object_etag: String,
    pub signer_key_id: String,
    pub signer_signature: String,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open the append transaction, waiting at most `lock_timeout` for the
    /// chain tail lock (`ChainContentionTimeout` otherwise).
    async fn begin_append(&self, lock_timeout: Duration) -> Result<Box<dyn AppendTx>>;

    /// Claim up to `limit` not-uploaded rows in append order, optionally for a
    /// single module, skipping rows held by other live claims.
    async fn claim_unanchored(
        &self,
        limit: usize,
        module: Option<&str>,
    ) -> Result<Box<dyn AnchorClaim>>;

    async fn get_event(&self, id: &str) -> Result<Option<LedgerEvent>>;

    /// Rows with `append_order > after_order`, in append order.
    async fn events_since(&self, after_order: i64, limit: usize) -> Result<Vec<LedgerEvent>>;

    async fn chain_head(&self) -> Result<Option<ChainTail>>;

    /// Manifests referencing an object key, most recent first.
    async fn batches_for_object_key(&self, object_key: &str) -> Result<Vec<BatchManifest>>;

    async fn batch_by_id(&self, batch_id: Uuid) -> Result<Option<BatchManifest>>;

    async fn list_batches(&self, limit: usize) -> Result<Vec<BatchManifest>>;

    /// Manifests whose covered rows are not all flagged as uploaded.
    async fn orphaned_batches(&self) -> Result<Vec<BatchManifest>>;

    /// Flag the given rows as anchored by `batch` (orphan repair). Rows already
    /// flagged are left untouched. Returns the number of rows updated.
    async fn mark_anchored(&self, batch: &BatchManifest, event_ids: &[String]) -> Result<u64>;
}

/// Exclusive append transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait AppendTx: Send {
    /// Chain tail as read under the lock; `None` for an empty ledger.
    fn tail(&self) -> Option<&ChainTail>;

    async fn find_event(&mut self, id: &str) -> Result<Option<LedgerEvent>>;

    /// Stage the next row; its `append_order` follows the tail.
    async fn insert(&mut self, row: NewLedgerRow) -> Result<LedgerEvent>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Claim over a window of unanchored rows. Dropping it without `commit`
/// releases the rows with nothing marked.
#[async_trait]
pub trait AnchorClaim: Send {
    fn events(&self) -> &[LedgerEvent];

    /// Stage the manifest and the uploaded flags for every claimed row.
    async fn record_batch(&mut self, batch: NewBatch) -> Result<BatchManifest>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn release(self: Box<Self>) -> Result<()>;
}
