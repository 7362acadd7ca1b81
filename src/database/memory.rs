//! In-process ledger store
//!
//! Same transactional semantics as the Postgres backend: a single async
//! mutex plays the role of the tail-row lock, and claimed rows are tracked in
//! a set that other claims skip. Used by tests and `memory://` deployments.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::models::{BatchManifest, ChainTail, LedgerEvent, NewLedgerRow};
use super::{AnchorClaim, AppendTx, LedgerStore, NewBatch};
use crate::error::{LedgerError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<LedgerEvent>,
    by_id: HashMap<String, usize>,
    batches: Vec<BatchManifest>,
    claimed: HashSet<i64>,
}

impl MemoryState {
    fn tail(&self) -> Option<ChainTail> {
        self.events.last().map(|e| ChainTail {
            append_order: e.append_order,
            record_hash: e.record_hash.clone(),
        })
    }

    fn event_mut(&mut self, append_order: i64) -> Option<&mut LedgerEvent> {
        let index = usize::try_from(append_order - 1).ok()?;
        self.events.get_mut(index)
    }
}

#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    append_lock: Arc<Mutex<()>>,
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        read_state(&self.state)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        write_state(&self.state)
    }

    pub fn event_count(&self) -> Result<usize> {
        Ok(self.read()?.events.len())
    }

    /// Mutate a stored row in place, bypassing every append-only guard.
    ///
    /// Exists for tamper drills: it is the equivalent of editing the ledger
    /// table by hand. Returns `false` if the id is unknown.
    pub fn with_stored_event_mut<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut LedgerEvent),
    {
        let mut state = self.write()?;
        let Some(&index) = state.by_id.get(id) else {
            return Ok(false);
        };
        f(&mut state.events[index]);
        Ok(true)
    }

    /// Insert a manifest without flagging its rows, reproducing a crash
    /// between manifest write and row flagging.
    pub fn insert_manifest_unchecked(&self, manifest: BatchManifest) -> Result<()> {
        self.write()?.batches.push(manifest);
        Ok(())
    }
}

fn read_state(state: &RwLock<MemoryState>) -> Result<RwLockReadGuard<'_, MemoryState>> {
    state
        .read()
        .map_err(|_| LedgerError::DatabaseError("Memory ledger state poisoned".to_string()))
}

fn write_state(state: &RwLock<MemoryState>) -> Result<RwLockWriteGuard<'_, MemoryState>> {
    state
        .write()
        .map_err(|_| LedgerError::DatabaseError("Memory ledger state poisoned".to_string()))
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin_append(&self, lock_timeout: Duration) -> Result<Box<dyn AppendTx>> {
        let guard = tokio::time::timeout(lock_timeout, self.append_lock.clone().lock_owned())
            .await
            .map_err(|_| {
                LedgerError::ChainContentionTimeout(format!(
                    "Chain tail lock not acquired within {:?}",
                    lock_timeout
                ))
            })?;

        let tail = self.read()?.tail();
        Ok(Box::new(MemoryAppendTx {
            _guard: guard,
            state: self.state.clone(),
            tail,
            staged: Vec::new(),
        }))
    }

    async fn claim_unanchored(
        &self,
        limit: usize,
        module: Option<&str>,
    ) -> Result<Box<dyn AnchorClaim>> {
        let mut state = self.write()?;
        let events: Vec<LedgerEvent> = state
            .events
            .iter()
            .filter(|e| !e.uploaded && !state.claimed.contains(&e.append_order))
            .filter(|e| module.map_or(true, |m| e.module == m))
            .take(limit)
            .cloned()
            .collect();

        for event in &events {
            state.claimed.insert(event.append_order);
        }
        debug!("Claimed {} unanchored events", events.len());

        Ok(Box::new(MemoryAnchorClaim {
            state: self.state.clone(),
            events,
            staged: None,
            finished: false,
        }))
    }

    async fn get_event(&self, id: &str) -> Result<Option<LedgerEvent>> {
        let state = self.read()?;
        Ok(state.by_id.get(id).map(|&i| state.events[i].clone()))
    }

    async fn events_since(&self, after_order: i64, limit: usize) -> Result<Vec<LedgerEvent>> {
        let state = self.read()?;
        let start = usize::try_from(after_order.max(0)).unwrap_or(0);
        Ok(state.events.iter().skip(start).take(limit).cloned().collect())
    }

    async fn chain_head(&self) -> Result<Option<ChainTail>> {
        Ok(self.read()?.tail())
    }

    async fn batches_for_object_key(&self, object_key: &str) -> Result<Vec<BatchManifest>> {
        let state = self.read()?;
        let mut batches: Vec<BatchManifest> = state
            .batches
            .iter()
            .filter(|b| b.object_key == object_key)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(batches)
    }

    async fn batch_by_id(&self, batch_id: Uuid) -> Result<Option<BatchManifest>> {
        Ok(self
            .read()?
            .batches
            .iter()
            .find(|b| b.batch_id == batch_id)
            .cloned())
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<BatchManifest>> {
        let state = self.read()?;
        Ok(state.batches.iter().rev().take(limit).cloned().collect())
    }

    async fn orphaned_batches(&self) -> Result<Vec<BatchManifest>> {
        let state = self.read()?;
        Ok(state
            .batches
            .iter()
            .filter(|batch| {
                state
                    .events
                    .iter()
                    .any(|e| batch.covers(e) && !e.uploaded)
            })
            .cloned()
            .collect())
    }

    async fn mark_anchored(&self, batch: &BatchManifest, event_ids: &[String]) -> Result<u64> {
        let mut state = self.write()?;
        let mut updated = 0;
        for id in event_ids {
            let Some(&index) = state.by_id.get(id) else {
                continue;
            };
            let event = &mut state.events[index];
            if !event.uploaded {
                event.uploaded = true;
                event.anchor_object_key = Some(batch.object_key.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }
}

struct MemoryAppendTx {
    _guard: OwnedMutexGuard<()>,
    state: Arc<RwLock<MemoryState>>,
    tail: Option<ChainTail>,
    staged: Vec<LedgerEvent>,
}

#[async_trait]
impl AppendTx for MemoryAppendTx {
    fn tail(&self) -> Option<&ChainTail> {
        self.tail.as_ref()
    }

    async fn find_event(&mut self, id: &str) -> Result<Option<LedgerEvent>> {
        if let Some(staged) = self.staged.iter().find(|e| e.id == id) {
            return Ok(Some(staged.clone()));
        }
        let state = read_state(&self.state)?;
        Ok(state.by_id.get(id).map(|&i| state.events[i].clone()))
    }

    async fn insert(&mut self, row: NewLedgerRow) -> Result<LedgerEvent> {
        let last_order = self
            .staged
            .last()
            .map(|e| e.append_order)
            .or_else(|| self.tail.as_ref().map(|t| t.append_order))
            .unwrap_or(0);

        let event = LedgerEvent {
            append_order: last_order + 1,
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
            recorded_at: Utc::now(),
        };
        self.staged.push(event.clone());
        Ok(event)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = write_state(&self.state)?;

        let current = state.tail().map(|t| t.append_order);
        if current != self.tail.as_ref().map(|t| t.append_order) {
            return Err(LedgerError::ChainContentionTimeout(
                "Chain tail moved while the append lock was held".to_string(),
            ));
        }
        if let Some(dup) = self.staged.iter().find(|e| state.by_id.contains_key(&e.id)) {
            return Err(LedgerError::DuplicateEventId(dup.id.clone()));
        }

        for event in &self.staged {
            let index = state.events.len();
            state.by_id.insert(event.id.clone(), index);
            state.events.push(event.clone());
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemoryAnchorClaim {
    state: Arc<RwLock<MemoryState>>,
    events: Vec<LedgerEvent>,
    staged: Option<BatchManifest>,
    finished: bool,
}

impl MemoryAnchorClaim {
    fn unclaim(&self, state: &mut MemoryState) {
        for event in &self.events {
            state.claimed.remove(&event.append_order);
        }
    }
}

#[async_trait]
impl AnchorClaim for MemoryAnchorClaim {
    fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    async fn record_batch(&mut self, batch: NewBatch) -> Result<BatchManifest> {
        let (first, last) = match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(LedgerError::DatabaseError(
                    "Cannot record a batch for an empty claim".to_string(),
                ))
            }
        };

        let manifest = BatchManifest {
            batch_id: batch.batch_id,
            module: batch.module,
            start_event_id: first.id.clone(),
            end_event_id: last.id.clone(),
            start_order: first.append_order,
            end_order: last.append_order,
            merkle_root: batch.merkle_root,
            record_count: self.events.len() as i64,
            object_key: batch.object_key,
            object_etag: batch.object_etag,
            signer_key_id: batch.signer_key_id,
            signer_signature: batch.signer_signature,
            uploaded_at: Utc::now(),
        };
        self.staged = Some(manifest.clone());
        Ok(manifest)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let state_handle = this.state.clone();
        let mut state = write_state(&state_handle)?;

        if let Some(manifest) = this.staged.take() {
            for claimed in &this.events {
                if let Some(event) = state.event_mut(claimed.append_order) {
                    if event.uploaded {
                        return Err(LedgerError::DatabaseError(format!(
                            "Event {} was anchored by another claim",
                            event.id
                        )));
                    }
                }
            }
            for claimed in &this.events {
                if let Some(event) = state.event_mut(claimed.append_order) {
                    event.uploaded = true;
                    event.anchor_object_key = Some(manifest.object_key.clone());
                }
            }
            state.batches.push(manifest);
        }

        this.unclaim(&mut state);
        this.finished = true;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let state_handle = this.state.clone();
        let mut state = write_state(&state_handle)?;
        this.unclaim(&mut state);
        this.finished = true;
        Ok(())
    }
}

impl Drop for MemoryAnchorClaim {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.state.write() {
            for event in &self.events {
                state.claimed.remove(&event.append_order);
            }
        }
    }
}
