//! Batch Anchoring
//!
//! Periodically commits contiguous windows of not-yet-uploaded ledger rows to
//! write-once object storage under a signed Merkle root, and records a batch
//! manifest for each committed window.

pub mod anchorer;
pub mod artifact;
pub mod merkle;
pub mod object_store;

pub use anchorer::{spawn_anchor_workers, AnchorConfig, AnchorOutcome, AnchorWorker, BatchAnchorer};
pub use artifact::{ArtifactEvent, BatchArtifact, BatchHeader};
pub use merkle::{generate_proof, merkle_root_from_hashes, MerkleProof};
pub use object_store::{FsObjectStore, HttpObjectStore, MemoryObjectStore, ObjectStore};
