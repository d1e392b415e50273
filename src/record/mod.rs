//! Signed records and local bookkeeping entities
//!
//! Two record kinds enter the dependency engine from the network: contexts
//! and context files. Both are immutable once signed. Accounts and
//! tombstones are local to this node and never leave it.

pub mod account;
pub mod context;
pub mod context_file;
pub mod deleted;

use serde::{Deserialize, Serialize};

use crate::crypto::{Digest, NodeId, Verifier};
use crate::error::GripError;

pub use account::Account;
pub use context::Context;
pub use context_file::{ContextFile, ContextFileBuilder};
pub use deleted::DeletedContextFile;

/// A signed record handed to the node by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignedRecord {
    Context(Context),
    ContextFile(ContextFile),
}

impl SignedRecord {
    pub fn dig(&self) -> &Digest {
        match self {
            SignedRecord::Context(c) => c.dig(),
            SignedRecord::ContextFile(f) => f.dig(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        match self {
            SignedRecord::Context(c) => c.node_id(),
            SignedRecord::ContextFile(f) => f.node_id(),
        }
    }

    pub fn sig(&self) -> &[u8] {
        match self {
            SignedRecord::Context(c) => c.sig(),
            SignedRecord::ContextFile(f) => f.sig(),
        }
    }

    /// Recompute the digest from the record's canonical fields.
    pub fn compute_dig(&self) -> Digest {
        match self {
            SignedRecord::Context(c) => c.compute_dig(),
            SignedRecord::ContextFile(f) => f.compute_digests().1,
        }
    }

    /// Check that the digests match the fields and that the author signed them.
    pub fn verify(&self, verifier: &dyn Verifier) -> Result<(), GripError> {
        if let SignedRecord::ContextFile(f) = self {
            let (data_dep_dig, _) = f.compute_digests();
            if &data_dep_dig != f.data_dep_dig() {
                return Err(GripError::DigestMismatch {
                    expected: f.data_dep_dig().to_hex(),
                    actual: data_dep_dig.to_hex(),
                });
            }
        }
        let computed = self.compute_dig();
        if &computed != self.dig() {
            return Err(GripError::DigestMismatch {
                expected: self.dig().to_hex(),
                actual: computed.to_hex(),
            });
        }
        verifier.verify(self.node_id(), self.dig().as_bytes(), self.sig())
    }
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
