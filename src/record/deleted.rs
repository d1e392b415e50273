//! Tombstones for discarded context files

use serde::{Deserialize, Serialize};

use crate::crypto::Digest;

use super::{unix_millis, ContextFile};

/// Record of a context file this node deliberately discarded.
///
/// Lets a later lookup tell "never had it" apart from "had it and threw it
/// away", so peers are not asked for it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedContextFile {
    pub context: Digest,
    pub dig: Digest,
    pub data_dep_dig: Digest,
    /// Unix millis of the deletion
    pub deleted_at: u64,
}

impl DeletedContextFile {
    pub fn of(file: &ContextFile) -> Self {
        Self {
            context: *file.context(),
            dig: *file.dig(),
            data_dep_dig: *file.data_dep_dig(),
            deleted_at: unix_millis(),
        }
    }
}
