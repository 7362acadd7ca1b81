//! Whole-ledger chain walk.

use serde::Serialize;

use crate::canonical::Canonicalizer;
use crate::database::models::LedgerEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LinkIssue {
    /// `prev_hash` does not match the preceding row's `record_hash`.
    HashGap,
    /// `append_order` skips positions.
    OrderGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLink {
    pub append_order: i64,
    pub event_id: String,
    pub issue: LinkIssue,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub event_count: u64,
    pub head_hash: Option<String>,
    /// The walked head equals the head recorded by the store.
    pub head_matches: bool,
    pub broken_links: Vec<BrokenLink>,
    /// Ids whose record hash does not recompute.
    pub tampered: Vec<String>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.head_matches && self.broken_links.is_empty() && self.tampered.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("Ledger chain is valid ({} events)", self.event_count)
        } else {
            format!(
                "Ledger chain is INVALID ({} events): {} broken links, {} tampered events{}",
                self.event_count,
                self.broken_links.len(),
                self.tampered.len(),
                if self.head_matches { "" } else { ", head mismatch" }
            )
        }
    }
}

/// Incremental chain checker fed one page of rows at a time.
pub(crate) struct ChainWalker<'a> {
    canonicalizer: &'a Canonicalizer,
    previous: Option<(i64, String)>,
    report: ChainReport,
}

impl<'a> ChainWalker<'a> {
    pub(crate) fn new(canonicalizer: &'a Canonicalizer) -> Self {
        Self {
            canonicalizer,
            previous: None,
            report: ChainReport::default(),
        }
    }

    pub(crate) fn last_order(&self) -> i64 {
        self.previous.as_ref().map_or(0, |(order, _)| *order)
    }

    pub(crate) fn push(&mut self, event: &LedgerEvent) {
        if self.canonicalizer.recompute_hash(event) != event.record_hash {
            self.report.tampered.push(event.id.clone());
        }

        let (expected_order, expected_prev) = match &self.previous {
            Some((order, hash)) => (order + 1, Some(hash.as_str())),
            None => (1, None),
        };

        if event.append_order != expected_order {
            self.report.broken_links.push(BrokenLink {
                append_order: event.append_order,
                event_id: event.id.clone(),
                issue: LinkIssue::OrderGap,
                description: format!(
                    "expected position {}, found {}",
                    expected_order, event.append_order
                ),
            });
        }

        if event.prev_hash.as_deref() != expected_prev {
            self.report.broken_links.push(BrokenLink {
                append_order: event.append_order,
                event_id: event.id.clone(),
                issue: LinkIssue::HashGap,
                description: format!(
                    "prev_hash {:?} does not match preceding record hash {:?}",
                    event.prev_hash, expected_prev
                ),
            });
        }

        self.previous = Some((event.append_order, event.record_hash.clone()));
        self.report.event_count += 1;
    }

    pub(crate) fn finish(mut self, store_head: Option<&str>) -> ChainReport {
        self.report.head_hash = self.previous.map(|(_, hash)| hash);
        self.report.head_matches = self.report.head_hash.as_deref() == store_head;
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalRecord;
    use chrono::Utc;
    use serde_json::json;

    fn chain(n: i64) -> Vec<LedgerEvent> {
        let mut out: Vec<LedgerEvent> = Vec::new();
        for order in 1..=n {
            let record = CanonicalRecord {
                id: format!("e{}", order),
                event_time: Utc::now(),
                event_type: "t".to_string(),
                actor_id: "a".to_string(),
                actor_role: "r".to_string(),
                module: "m".to_string(),
                payload: json!({"n": order}),
            };
            out.push(LedgerEvent {
                append_order: order,
                id: record.id.clone(),
                event_time: record.event_time,
                event_type: record.event_type.clone(),
                actor_id: record.actor_id.clone(),
                actor_role: record.actor_role.clone(),
                module: record.module.clone(),
                payload: record.payload.clone(),
                prev_hash: out.last().map(|e| e.record_hash.clone()),
                record_hash: record.record_hash(),
                signer_key_id: "k".to_string(),
                signature: "s".to_string(),
                uploaded: false,
                anchor_object_key: None,
                recorded_at: Utc::now(),
            });
        }
        out
    }

    #[test]
    fn test_intact_chain() {
        let events = chain(4);
        let canonicalizer = Canonicalizer::default();
        let mut walker = ChainWalker::new(&canonicalizer);
        events.iter().for_each(|e| walker.push(e));
        let head = events[3].record_hash.clone();
        let report = walker.finish(Some(&head));
        assert!(report.is_valid(), "{}", report.summary());
        assert_eq!(report.event_count, 4);
        assert!(report.broken_links.is_empty());
    }

    fn walk(events: &[LedgerEvent]) -> ChainReport {
        let canonicalizer = Canonicalizer::default();
        let mut walker = ChainWalker::new(&canonicalizer);
        events.iter().for_each(|e| walker.push(e));
        let head = events.last().map(|e| e.record_hash.clone());
        walker.finish(head.as_deref())
    }

    #[test]
    fn test_tampered_payload_found() {
        let mut events = chain(3);
        events[1].payload = json!({"n": 99});
        let report = walk(&events);
        assert_eq!(report.tampered, vec!["e2".to_string()]);
        assert!(report.broken_links.is_empty());
    }

    #[test]
    fn test_removed_row_breaks_chain() {
        let mut events = chain(4);
        events.remove(1);
        let report = walk(&events);
        let gaps = &report.broken_links;
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| g.event_id == "e3"));
        assert!(gaps.iter().any(|g| g.issue == LinkIssue::OrderGap));
        assert!(gaps.iter().any(|g| g.issue == LinkIssue::HashGap));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_head_mismatch_detected() {
        let events = chain(2);
        let canonicalizer = Canonicalizer::default();
        let mut walker = ChainWalker::new(&canonicalizer);
        events.iter().for_each(|e| walker.push(e));
        let report = walker.finish(Some("sha256:other"));
        assert!(!report.head_matches);
        assert!(!report.is_valid());
    }
}
