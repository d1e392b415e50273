//! Derived per-file graph metadata

use serde::{Deserialize, Serialize};

use crate::error::{GripError, Result};
use crate::record::ContextFile;

/// Locally derived properties of a stored context file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapFields {
    pub head: bool,
    pub leaf: bool,
    pub depth: u32,
    pub covered_by_snapshot: bool,
    /// An uncovered ancestor was discarded; the content can't be rebuilt here.
    pub unconstructable: bool,
}

/// A stored context file together with its wrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFileWrap {
    pub file: ContextFile,
    pub wrap: WrapFields,
}

impl ContextFileWrap {
    pub fn data_dep_dig(&self) -> &crate::crypto::Digest {
        self.file.data_dep_dig()
    }
}

/// Recompute the wrap of `file` from its locally stored neighbours.
///
/// `deps` must be stored files that `file` lists in `depends_on`, and every
/// entry of `dependents` must list `file`. `unconstructable` is left false;
/// the caller decides whether to carry it.
pub fn update(
    file: &ContextFile,
    deps: &[ContextFileWrap],
    dependents: &[ContextFileWrap],
) -> Result<WrapFields> {
    for dep in deps {
        if !file.does_depend_on(dep.data_dep_dig()) {
            return Err(GripError::GraphInconsistency(format!(
                "{} is not a dependency of {}",
                dep.data_dep_dig().short(),
                file.data_dep_dig().short()
            )));
        }
    }
    for dependent in dependents {
        if !dependent.file.does_depend_on(file.data_dep_dig()) {
            return Err(GripError::GraphInconsistency(format!(
                "{} does not depend on {}",
                dependent.data_dep_dig().short(),
                file.data_dep_dig().short()
            )));
        }
    }

    let head = dependents.is_empty();
    let depth = dependents
        .iter()
        .map(|d| d.wrap.depth + 1)
        .max()
        .unwrap_or(0);
    let covered_by_snapshot = !head
        && dependents
            .iter()
            .all(|d| d.file.is_snapshot() || d.wrap.covered_by_snapshot);

    Ok(WrapFields {
        head,
        leaf: deps.is_empty(),
        depth,
        covered_by_snapshot,
        unconstructable: false,
    })
}
