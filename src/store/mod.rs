//! Persistent graph state
//!
//! All reads and writes happen through a [`GraphTx`] handed out by
//! [`Store::transact`]. A transaction either commits as a whole or leaves
//! no trace, so a failed insertion or deletion never exposes a half
//! updated graph.
//!
//! Two backends:
//! - [`SqliteStore`]: rusqlite with WAL, the node's on-disk store
//! - [`MemoryStore`]: copy-on-write maps, for tests and embedding

pub mod memory;
pub mod schema;
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::crypto::Digest;
use crate::error::Result;
use crate::graph::{ContextFileWrap, WrapFields};
use crate::record::{Account, Context, ContextFile, DeletedContextFile};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A context file refused at admission, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedFile {
    pub file: ContextFile,
    pub reason: String,
    pub quarantined_at: u64,
}

/// Operations available inside a transaction.
///
/// File lookups are keyed by `data_dep_dig`. List queries return files in
/// ascending `data_dep_dig` order so results are deterministic across
/// backends.
pub trait GraphTx {
    // -- contexts --

    fn context(&self, dig: &Digest) -> Result<Option<Context>>;

    /// Register a context and the account its storage is charged to.
    fn store_context(&mut self, context: &Context, account_id: &str) -> Result<()>;

    fn contexts(&self) -> Result<Vec<Context>>;

    fn context_account(&self, context: &Digest) -> Result<Option<String>>;

    // -- context files --

    fn context_file(&self, data_dep_dig: &Digest) -> Result<Option<ContextFileWrap>>;

    /// Stored files of `context` that list `data_dep_dig` as a dependency.
    fn dependents_of(&self, context: &Digest, data_dep_dig: &Digest) -> Result<Vec<ContextFileWrap>>;

    fn context_files(&self, context: &Digest) -> Result<Vec<ContextFileWrap>>;

    fn context_heads(&self, context: &Digest) -> Result<Vec<ContextFileWrap>>;

    /// Leaves with the given coverage; `index` of `None` matches both kinds.
    fn context_leaves(
        &self,
        context: &Digest,
        covered: bool,
        index: Option<bool>,
    ) -> Result<Vec<ContextFileWrap>>;

    fn covered_snapshots(&self, context: &Digest) -> Result<Vec<ContextFileWrap>>;

    fn insert_context_file(&mut self, file: &ContextFile, wrap: &WrapFields) -> Result<()>;

    fn update_wrap(&mut self, data_dep_dig: &Digest, wrap: &WrapFields) -> Result<()>;

    /// Remove the file, its wrap and its outgoing dependency edges.
    fn delete_context_file(&mut self, data_dep_dig: &Digest) -> Result<()>;

    /// Number of stored files whose content is `content`.
    fn content_references(&self, content: &Digest) -> Result<u64>;

    // -- tombstones --

    fn append_tombstone(&mut self, tombstone: &DeletedContextFile) -> Result<()>;

    fn tombstone(&self, data_dep_dig: &Digest) -> Result<Option<DeletedContextFile>>;

    fn tombstones(&self, context: &Digest) -> Result<Vec<DeletedContextFile>>;

    // -- quarantine --

    fn quarantine(&mut self, file: &ContextFile, reason: &str) -> Result<()>;

    fn quarantined(&self, context: &Digest) -> Result<Vec<QuarantinedFile>>;

    // -- accounts --

    fn store_account(&mut self, account: &Account) -> Result<()>;

    fn account(&self, account_id: &str) -> Result<Option<Account>>;

    fn set_disk_space_used(&mut self, account_id: &str, used: u64) -> Result<()>;

    fn set_account_message(&mut self, account_id: &str, message: &str) -> Result<()>;
}

/// Transactional access to the graph.
pub trait Store: Send + Sync {
    /// Run `f` in a write transaction, committing if it returns `Ok`.
    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>;

    /// Run `f` in a write transaction that is always rolled back.
    fn dry_run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>;
}
