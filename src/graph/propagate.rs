//! Wrap propagation after the graph changes

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tracing::debug;

use crate::crypto::Digest;
use crate::error::{GripError, Result};
use crate::record::ContextFile;
use crate::store::GraphTx;

use super::sanity;
use super::wrap::{update, ContextFileWrap, WrapFields};

/// How coverage is treated for a file that has just lost its last dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageRule {
    /// Plain recomputation from the current dependents.
    Standard,
    /// A covered file left without dependents by a deletion stays covered:
    /// its content is still carried by the snapshot that covered the victim.
    RetainOrphaned,
}

/// Stored dependencies of `file` that belong to the same context.
pub fn local_deps(tx: &dyn GraphTx, file: &ContextFile) -> Result<Vec<ContextFileWrap>> {
    let mut deps = Vec::with_capacity(file.depends_on().len());
    for dig in file.depends_on() {
        if let Some(dep) = tx.context_file(dig)? {
            if dep.file.context() == file.context() {
                deps.push(dep);
            }
        }
    }
    Ok(deps)
}

/// Admit `file` into the graph and bring every affected wrap up to date.
///
/// Runs the sanity check, stores the file with its computed wrap, then
/// propagates to its dependents (which stop being leaves) and to its
/// dependencies (which gain a dependent).
pub fn insert(tx: &mut dyn GraphTx, file: &ContextFile) -> Result<WrapFields> {
    sanity::check(tx, file)?;

    let deps = local_deps(tx, file)?;
    let dependents = tx.dependents_of(file.context(), file.data_dep_dig())?;

    let mut wrap = update(file, &deps, &dependents)?;
    wrap.unconstructable = !file.is_snapshot() && deps.iter().any(|d| d.wrap.unconstructable);
    tx.insert_context_file(file, &wrap)?;

    let seeds: Vec<Digest> = dependents
        .iter()
        .chain(deps.iter())
        .map(|w| *w.data_dep_dig())
        .collect();
    propagate(tx, &seeds, CoverageRule::Standard)?;

    debug!(
        file = %file.data_dep_dig().short(),
        depth = wrap.depth,
        head = wrap.head,
        leaf = wrap.leaf,
        "Inserted context file"
    );
    Ok(wrap)
}

/// Recompute the wraps of `seeds` and, transitively, of every dependency
/// whose dependents changed.
///
/// Pending files are taken shallowest stored depth first. A file's local
/// dependents are always shallower than the file itself, so each file is
/// recomputed after all of its affected dependents and only files that
/// actually become dirty are ever read. Returns the number of wraps
/// rewritten.
pub fn propagate(tx: &mut dyn GraphTx, seeds: &[Digest], rule: CoverageRule) -> Result<usize> {
    let mut pending: BinaryHeap<Reverse<(u32, Digest)>> = BinaryHeap::new();
    let mut queued: HashSet<Digest> = HashSet::new();
    for seed in seeds {
        if let Some(stored) = tx.context_file(seed)? {
            if queued.insert(*seed) {
                pending.push(Reverse((stored.wrap.depth, *seed)));
            }
        }
    }

    let mut rewritten = 0;
    while let Some(Reverse((_, dig))) = pending.pop() {
        let Some(current) = tx.context_file(&dig)? else {
            continue;
        };
        let deps = local_deps(tx, &current.file)?;
        let dependents = tx.dependents_of(current.file.context(), &dig)?;

        let mut next = update(&current.file, &deps, &dependents)?;
        next.unconstructable = current.wrap.unconstructable;
        if rule == CoverageRule::RetainOrphaned
            && dependents.is_empty()
            && current.wrap.covered_by_snapshot
        {
            next.covered_by_snapshot = true;
        }

        if next == current.wrap {
            continue;
        }
        if next.depth < current.wrap.depth && rule == CoverageRule::Standard {
            return Err(GripError::GraphInconsistency(format!(
                "depth of {} would shrink from {} to {} on insertion",
                dig.short(),
                current.wrap.depth,
                next.depth
            )));
        }
        tx.update_wrap(&dig, &next)?;
        rewritten += 1;

        for dep in &deps {
            if queued.insert(*dep.data_dep_dig()) {
                pending.push(Reverse((dep.wrap.depth, *dep.data_dep_dig())));
            }
        }
    }

    Ok(rewritten)
}
