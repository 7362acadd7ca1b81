//! Downstream index feed
//!
//! Wraps the writer's broadcast channel with a cursor so a secondary indexer
//! sees every committed row exactly once, in append order, even after it
//! falls behind the channel.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::database::models::LedgerEvent;
use crate::database::LedgerStore;
use crate::error::Result;

pub struct IndexFeed {
    store: Arc<dyn LedgerStore>,
    receiver: broadcast::Receiver<LedgerEvent>,
    cursor: i64,
    page_size: usize,
}

impl IndexFeed {
    /// Start delivering rows appended after `cursor` (0 = from the beginning).
    pub fn new(
        store: Arc<dyn LedgerStore>,
        receiver: broadcast::Receiver<LedgerEvent>,
        cursor: i64,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            receiver,
            cursor,
            page_size: page_size.max(1),
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Next rows past the cursor. Reads from storage until caught up, then
    /// waits on the channel. Returns an empty vector once the writer is gone.
    pub async fn next_batch(&mut self) -> Result<Vec<LedgerEvent>> {
        let backlog = self.store.events_since(self.cursor, self.page_size).await?;
        if !backlog.is_empty() {
            self.advance(&backlog);
            return Ok(backlog);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) if event.append_order <= self.cursor => continue,
                Ok(event) if event.append_order == self.cursor + 1 => {
                    self.cursor = event.append_order;
                    return Ok(vec![event]);
                }
                // A gap (commit order raced the channel) or lag: reread storage.
                Ok(_) => return self.catch_up().await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Index feed lagged by {} rows; resuming from storage", skipped);
                    return self.catch_up().await;
                }
                Err(RecvError::Closed) => return Ok(Vec::new()),
            }
        }
    }

    async fn catch_up(&mut self) -> Result<Vec<LedgerEvent>> {
        let rows = self.store.events_since(self.cursor, self.page_size).await?;
        self.advance(&rows);
        Ok(rows)
    }

    fn advance(&mut self, rows: &[LedgerEvent]) {
        if let Some(last) = rows.last() {
            self.cursor = last.append_order;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Canonicalizer;
    use crate::crypto::LocalSigner;
    use crate::database::models::IncomingEvent;
    use crate::database::MemoryLedgerStore;
    use crate::ledger::{LedgerWriter, WriterConfig};
    use chrono::Utc;
    use serde_json::json;

    fn event(id: &str) -> IncomingEvent {
        IncomingEvent {
            id: Some(id.to_string()),
            event_time: Utc::now(),
            event_type: "auth.login".to_string(),
            actor_id: "u1".to_string(),
            actor_role: "member".to_string(),
            module: "auth".to_string(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_feed_replays_backlog_then_follows() {
        let store = MemoryLedgerStore::new();
        let writer = LedgerWriter::new(
            Arc::new(store.clone()),
            Arc::new(LocalSigner::ephemeral()),
            Canonicalizer::default(),
            WriterConfig {
                feed_capacity: 2,
                ..WriterConfig::default()
            },
        );
        let mut feed = IndexFeed::new(Arc::new(store.clone()), writer.subscribe(), 0, 10);

        // More rows than the channel holds: the receiver lags.
        for i in 1..=5 {
            writer.append(&event(&i.to_string())).await.unwrap();
        }
        let backlog = feed.next_batch().await.unwrap();
        assert_eq!(backlog.len(), 5);
        assert_eq!(feed.cursor(), 5);

        writer.append(&event("6")).await.unwrap();
        let mut seen = Vec::new();
        while seen.is_empty() {
            seen.extend(feed.next_batch().await.unwrap());
        }
        assert_eq!(seen[0].id, "6");
        assert_eq!(feed.cursor(), 6);
    }
}
