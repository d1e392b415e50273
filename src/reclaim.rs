//! Quota-driven storage reclamation
//!
//! When an account runs short of space, files of a context are discarded
//! tier by tier. The early tiers only remove history whose content is
//! still carried by a later snapshot. The last tier discards uncovered
//! leaves and so loses history; files that depended on them are marked
//! unconstructable.
//!
//! Every discarded file leaves a [`DeletedContextFile`] tombstone and
//! credits its size back to the owning account.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::Digest;
use crate::error::{GripError, Result};
use crate::graph::{self, ContextFileWrap, CoverageRule};
use crate::record::DeletedContextFile;
use crate::store::GraphTx;

/// Message stored on an account when reclamation cannot free enough space.
pub const DEFAULT_EXHAUSTED_MESSAGE: &str = "out of space, index too large";

/// One class of reclamation candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimTier {
    /// Snapshots whose content is carried by a later snapshot
    CoveredSnapshots,
    CoveredLeaves,
    CoveredIndexLeaves,
    /// Any uncovered leaf; discards history
    UncoveredLeaves,
    UncoveredNonIndexLeaves,
    UncoveredIndexLeaves,
}

impl ReclaimTier {
    /// Candidates of this tier in eviction order: deepest first, then largest.
    pub fn candidates(&self, tx: &dyn GraphTx, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        let mut found = match self {
            ReclaimTier::CoveredSnapshots => tx.covered_snapshots(context)?,
            ReclaimTier::CoveredLeaves => tx.context_leaves(context, true, Some(false))?,
            ReclaimTier::CoveredIndexLeaves => tx.context_leaves(context, true, Some(true))?,
            ReclaimTier::UncoveredLeaves => tx.context_leaves(context, false, None)?,
            ReclaimTier::UncoveredNonIndexLeaves => tx.context_leaves(context, false, Some(false))?,
            ReclaimTier::UncoveredIndexLeaves => tx.context_leaves(context, false, Some(true))?,
        };
        found.sort_by(|a, b| {
            b.wrap
                .depth
                .cmp(&a.wrap.depth)
                .then_with(|| b.file.size().cmp(&a.file.size()))
        });
        Ok(found)
    }

    /// Does `candidate` currently belong to this tier?
    pub fn admits(&self, candidate: &ContextFileWrap) -> bool {
        let w = &candidate.wrap;
        let f = &candidate.file;
        match self {
            ReclaimTier::CoveredSnapshots => f.is_snapshot() && w.covered_by_snapshot,
            ReclaimTier::CoveredLeaves => w.leaf && w.covered_by_snapshot && !f.is_index(),
            ReclaimTier::CoveredIndexLeaves => w.leaf && w.covered_by_snapshot && f.is_index(),
            ReclaimTier::UncoveredLeaves => w.leaf && !w.covered_by_snapshot,
            ReclaimTier::UncoveredNonIndexLeaves => {
                w.leaf && !w.covered_by_snapshot && !f.is_index()
            }
            ReclaimTier::UncoveredIndexLeaves => w.leaf && !w.covered_by_snapshot && f.is_index(),
        }
    }

    /// Deleting from this tier loses history.
    pub fn is_damaging(&self) -> bool {
        matches!(
            self,
            ReclaimTier::UncoveredLeaves
                | ReclaimTier::UncoveredNonIndexLeaves
                | ReclaimTier::UncoveredIndexLeaves
        )
    }
}

impl fmt::Display for ReclaimTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReclaimTier::CoveredSnapshots => "covered_snapshots",
            ReclaimTier::CoveredLeaves => "covered_leaves",
            ReclaimTier::CoveredIndexLeaves => "covered_index_leaves",
            ReclaimTier::UncoveredLeaves => "uncovered_leaves",
            ReclaimTier::UncoveredNonIndexLeaves => "uncovered_non_index_leaves",
            ReclaimTier::UncoveredIndexLeaves => "uncovered_index_leaves",
        };
        f.write_str(name)
    }
}

/// Ordered tiers and the message recorded when they run dry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimPolicy {
    pub tiers: Vec<ReclaimTier>,
    pub exhausted_message: String,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                ReclaimTier::CoveredSnapshots,
                ReclaimTier::CoveredLeaves,
                ReclaimTier::CoveredIndexLeaves,
                ReclaimTier::UncoveredLeaves,
            ],
            exhausted_message: DEFAULT_EXHAUSTED_MESSAGE.to_string(),
        }
    }
}

/// A single discarded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eviction {
    pub tombstone: DeletedContextFile,
    pub tier: ReclaimTier,
    pub size: u64,
    pub depth: u32,
    /// Content blob of the discarded file
    pub content: Digest,
    /// Files newly marked unconstructable by this deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unconstructable: Vec<Digest>,
}

/// Outcome of a reclamation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub requested: u64,
    pub freed: u64,
    pub evictions: Vec<Eviction>,
    /// Files whose deletion failed and were passed over
    pub skipped: Vec<Digest>,
}

impl ReclaimReport {
    /// True if any eviction came from a tier that loses history.
    pub fn damaging(&self) -> bool {
        self.evictions.iter().any(|e| e.tier.is_damaging())
    }
}

/// Pick and retire victims inside `tx` until `needed` bytes are freed or
/// every tier is empty.
///
/// Candidate lists are re-read after each retirement because a deletion
/// can expose new leaves; tiers are always scanned from the first. Files
/// in `skip` are never chosen. Returns the evictions in order; the caller
/// compares their total size with `needed`. Nothing is logged here;
/// callers log the evictions that commit.
pub fn sweep(
    tx: &mut dyn GraphTx,
    context: &Digest,
    needed: u64,
    policy: &ReclaimPolicy,
    skip: &HashSet<Digest>,
) -> Result<Vec<Eviction>> {
    let mut evictions = Vec::new();
    let mut freed = 0u64;

    while freed < needed {
        let Some((victim, tier)) = next_victim(tx, context, policy, skip)? else {
            break;
        };
        let eviction = retire(tx, &victim, tier)?;
        freed = freed.saturating_add(eviction.size);
        evictions.push(eviction);
    }

    Ok(evictions)
}

fn next_victim(
    tx: &dyn GraphTx,
    context: &Digest,
    policy: &ReclaimPolicy,
    skip: &HashSet<Digest>,
) -> Result<Option<(ContextFileWrap, ReclaimTier)>> {
    for tier in &policy.tiers {
        let found = tier
            .candidates(tx, context)?
            .into_iter()
            .find(|c| !skip.contains(c.data_dep_dig()));
        if let Some(victim) = found {
            return Ok(Some((victim, *tier)));
        }
    }
    Ok(None)
}

/// Remove one file from the graph.
///
/// Appends the tombstone, deletes the file with its edges, marks
/// dependents unconstructable when `tier` loses history, and recomputes
/// the wraps of the former neighbours. Blob removal and quota credit are
/// left to the caller.
pub fn retire(tx: &mut dyn GraphTx, victim: &ContextFileWrap, tier: ReclaimTier) -> Result<Eviction> {
    let file = &victim.file;
    let tombstone = DeletedContextFile::of(file);

    let dependents = tx.dependents_of(file.context(), file.data_dep_dig())?;
    let deps = graph::local_deps(tx, file)?;

    tx.append_tombstone(&tombstone)?;
    tx.delete_context_file(file.data_dep_dig())?;

    let unconstructable = if tier.is_damaging() {
        mark_unconstructable(tx, &dependents)?
    } else {
        Vec::new()
    };

    let seeds: Vec<Digest> = dependents
        .iter()
        .chain(deps.iter())
        .map(|w| *w.data_dep_dig())
        .collect();
    graph::propagate(tx, &seeds, CoverageRule::RetainOrphaned)?;

    Ok(Eviction {
        tombstone,
        tier,
        size: file.size(),
        depth: victim.wrap.depth,
        content: *file.content(),
        unconstructable,
    })
}

/// Mark `start` and everything built on it unconstructable, stopping at
/// snapshots, which carry their full content. Returns the files that were
/// not marked before.
fn mark_unconstructable(tx: &mut dyn GraphTx, start: &[ContextFileWrap]) -> Result<Vec<Digest>> {
    let mut visited: BTreeSet<Digest> = BTreeSet::new();
    let mut stack: Vec<ContextFileWrap> = start.to_vec();
    let mut marked = Vec::new();

    while let Some(current) = stack.pop() {
        if current.file.is_snapshot() || !visited.insert(*current.data_dep_dig()) {
            continue;
        }
        if !current.wrap.unconstructable {
            let mut wrap = current.wrap;
            wrap.unconstructable = true;
            tx.update_wrap(current.data_dep_dig(), &wrap)?;
            marked.push(*current.data_dep_dig());
        }
        stack.extend(tx.dependents_of(current.file.context(), current.data_dep_dig())?);
    }
    Ok(marked)
}

/// Bytes the evictions free.
pub fn freed_bytes(evictions: &[Eviction]) -> u64 {
    evictions.iter().fold(0u64, |acc, e| acc.saturating_add(e.size))
}

pub(crate) fn quota_exhausted(account_id: &str, needed: u64, reclaimable: u64) -> GripError {
    GripError::QuotaExhausted {
        account_id: account_id.to_string(),
        needed,
        reclaimable,
    }
}
