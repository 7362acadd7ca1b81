//! Ledger Writer
//!
//! Canonicalizes, signs and appends events to the single global hash chain,
//! and publishes committed rows to downstream indexers.

pub mod feed;
pub mod writer;

pub use feed::IndexFeed;
pub use writer::{AppendOutcome, LedgerWriter, WriterConfig};
