//! grip-node: context file dependency engine for a peer-to-peer sync node
//!
//! Nodes exchange signed, content-addressed records describing shared
//! contexts (change histories) and the files that belong to them. This
//! crate keeps the per-context dependency graph of those files:
//!
//! - admitting files, with dependency sanity checks and quarantine
//! - deriving head / leaf / depth / snapshot-coverage for every file
//! - reclaiming space tier by tier when an account's quota runs out
//! - recording a tombstone for every discarded file
//!
//! Network transport lives elsewhere; [`node::GripNode`] is the boundary
//! where verified records enter.
//!
//! ## Modules
//!
//! - `record` - signed records and local bookkeeping entities
//! - `graph` - wraps, sanity checks and propagation
//! - `store` - transactional persistence (SQLite, memory)
//! - `blobs` - content blob storage
//! - `reclaim` - tiered space reclamation
//! - `engine` - admission and reclamation entry points
//! - `node` - async facade used by the binary

pub mod blobs;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod reclaim;
pub mod record;
pub mod store;

pub use blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::Config;
pub use crypto::{Digest, Ed25519Verifier, NodeId, NodeKey, Signer, Verifier};
pub use engine::{Admission, ContextStatus, Engine};
pub use error::{DependencyFault, GripError, Result};
pub use graph::{ContextFileWrap, WrapFields};
pub use node::{Contribution, GripNode, Received};
pub use reclaim::{ReclaimPolicy, ReclaimReport, ReclaimTier};
pub use record::{Account, Context, ContextFile, DeletedContextFile, SignedRecord};
pub use store::{GraphTx, MemoryStore, SqliteStore, Store};
