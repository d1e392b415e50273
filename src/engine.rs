//! Context file dependency engine
//!
//! Entry point for everything that changes the graph: admitting context
//! files and reclaiming space. Work on one context is serialized through a
//! per-context lock; different contexts proceed in parallel, with the
//! store's transactions keeping each step atomic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::blobs::BlobStore;
use crate::crypto::Digest;
use crate::error::{GripError, Result};
use crate::graph::{self, ContextFileWrap, WrapFields};
use crate::reclaim::{self, Eviction, ReclaimPolicy, ReclaimReport};
use crate::record::{Account, Context, ContextFile, DeletedContextFile};
use crate::store::{GraphTx, QuarantinedFile, Store};

/// Outcome of [`Engine::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The file joined the graph with this wrap
    Stored(WrapFields),
    /// A file with the same `data_dep_dig` is already stored
    AlreadyStored,
    /// This node discarded the file earlier and won't take it back
    PreviouslyDiscarded,
}

/// Summary of one context's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStatus {
    pub context: Context,
    pub account: Account,
    pub files: usize,
    pub heads: usize,
    pub leaves: usize,
    pub covered: usize,
    pub unconstructable: usize,
    pub bytes: u64,
    pub tombstones: usize,
    pub quarantined: usize,
}

enum Preflight {
    Ready { account_id: String, shortfall: u64 },
    AlreadyStored,
    PreviouslyDiscarded,
}

pub struct Engine<S: Store, B: BlobStore> {
    store: S,
    blobs: B,
    policy: ReclaimPolicy,
    locks: DashMap<Digest, Arc<Mutex<()>>>,
    /// Content digests being stored by [`Engine::admit_content`], with counts
    uploads: DashMap<Digest, usize>,
}

impl<S: Store, B: BlobStore> Engine<S, B> {
    pub fn new(store: S, blobs: B, policy: ReclaimPolicy) -> Self {
        Self {
            store,
            blobs,
            policy,
            locks: DashMap::new(),
            uploads: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn policy(&self) -> &ReclaimPolicy {
        &self.policy
    }

    fn context_lock(&self, context: &Digest) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(*context).or_default())
    }

    /// Create the account if missing; an existing account keeps its usage
    /// and takes the new limit.
    pub fn open_account(&self, account_id: &str, max_disk_space: u64) -> Result<Account> {
        self.store.transact(|tx| {
            let account = match tx.account(account_id)? {
                Some(mut existing) => {
                    existing.max_disk_space = max_disk_space;
                    existing
                }
                None => {
                    info!(account = %account_id, max_disk_space, "Opened account");
                    Account::new(account_id, max_disk_space)
                }
            };
            tx.store_account(&account)?;
            Ok(account)
        })
    }

    pub fn account(&self, account_id: &str) -> Result<Option<Account>> {
        self.store.transact(|tx| tx.account(account_id))
    }

    /// Register `context` and charge its storage to `account_id`.
    pub fn register_context(&self, context: &Context, account_id: &str) -> Result<()> {
        self.store.transact(|tx| {
            if tx.account(account_id)?.is_none() {
                return Err(GripError::UnknownAccount(account_id.to_string()));
            }
            if tx.context(context.dig())?.is_some() {
                return Ok(());
            }
            tx.store_context(context, account_id)?;
            info!(context = %context.dig().short(), name = %context.name(), account = %account_id, "Registered context");
            Ok(())
        })
    }

    /// Bring a context file into the graph.
    ///
    /// Space for the file is charged to the context's account. A shortfall
    /// is reclaimed from the same context in the transaction that inserts
    /// the file, so coverage already reflects its arrival when victims are
    /// chosen; the file and the files it depends on are never victims. A
    /// file with a bad dependency list is quarantined and rejected.
    pub fn admit(&self, file: &ContextFile) -> Result<Admission> {
        let context = *file.context();
        let lock = self.context_lock(&context);
        let _guard = lock
            .lock()
            .map_err(|e| GripError::Internal(format!("Lock poisoned: {}", e)))?;

        let preflight = self.store.dry_run(|tx| preflight(tx, file));
        let (account_id, shortfall) = match preflight {
            Ok(Preflight::Ready { account_id, shortfall }) => (account_id, shortfall),
            Ok(Preflight::AlreadyStored) => return Ok(Admission::AlreadyStored),
            Ok(Preflight::PreviouslyDiscarded) => {
                info!(file = %file.data_dep_dig().short(), "Refusing previously discarded context file");
                return Ok(Admission::PreviouslyDiscarded);
            }
            Err(e) => return Err(self.reject(file, e)),
        };

        let mut skip: HashSet<Digest> = file.depends_on().iter().copied().collect();
        skip.insert(*file.data_dep_dig());

        loop {
            let mut removed = Vec::new();
            let mut failed: Option<Digest> = None;

            let stored = self.store.transact(|tx| {
                let wrap = graph::insert(tx, file)?;

                let evictions = if shortfall > 0 {
                    reclaim::sweep(tx, &context, shortfall, &self.policy, &skip)?
                } else {
                    Vec::new()
                };
                let freed = reclaim::freed_bytes(&evictions);
                if freed < shortfall {
                    return Err(reclaim::quota_exhausted(&account_id, shortfall, freed));
                }

                let mut account = tx
                    .account(&account_id)?
                    .ok_or_else(|| GripError::UnknownAccount(account_id.clone()))?;
                account.disk_space_used = account.disk_space_used.saturating_sub(freed);
                let short = account.shortfall(file.size());
                if short > 0 {
                    return Err(reclaim::quota_exhausted(&account_id, short, 0));
                }
                tx.set_disk_space_used(&account_id, account.disk_space_used + file.size())?;

                for eviction in &evictions {
                    if let Err(e) = self.drop_blob(&*tx, &eviction.content, &mut removed) {
                        failed = Some(eviction.tombstone.data_dep_dig);
                        return Err(e);
                    }
                }
                Ok((wrap, evictions))
            });

            match stored {
                Ok((wrap, evictions)) => {
                    for eviction in &evictions {
                        log_eviction(&context, eviction);
                    }
                    info!(
                        file = %file.data_dep_dig().short(),
                        path = %file.path(),
                        depth = wrap.depth,
                        size = file.size(),
                        evicted = evictions.len(),
                        "Admitted context file"
                    );
                    return Ok(Admission::Stored(wrap));
                }
                Err(e) => {
                    self.restore_blobs(removed);
                    if let Some(victim) = failed {
                        warn!(file = %victim.short(), error = %e, "Eviction failed, re-planning without it");
                        skip.insert(victim);
                        continue;
                    }
                    self.note_exhausted(&context, &account_id, &e);
                    return Err(self.reject(file, e));
                }
            }
        }
    }

    /// Store `data` as a blob and admit the file `build` makes over its digest.
    ///
    /// Until admission finishes the blob counts as an upload in flight, and
    /// reclamation in any context leaves it alone. If admission fails and
    /// nothing references the blob, it is removed again.
    pub fn admit_content<F>(&self, data: &[u8], build: F) -> Result<(ContextFile, Admission)>
    where
        F: FnOnce(Digest) -> ContextFile,
    {
        let content = Digest::of(data);
        *self.uploads.entry(content).or_insert(0) += 1;

        let result = self.blobs.put(data).and_then(|stored| {
            let file = build(stored);
            self.admit(&file).map(|admission| (file, admission))
        });

        self.finish_upload(&content);
        if result.is_err() {
            let mut removed = Vec::new();
            let dropped = self
                .store
                .transact(|tx| self.drop_blob(&*tx, &content, &mut removed));
            if let Err(e) = dropped {
                self.restore_blobs(removed);
                warn!(content = %content.short(), error = %e, "Failed to drop unused blob");
            }
        }
        result
    }

    fn finish_upload(&self, content: &Digest) {
        if let Entry::Occupied(mut slot) = self.uploads.entry(*content) {
            let remaining = slot.get().saturating_sub(1);
            if remaining == 0 {
                slot.remove();
            } else {
                *slot.get_mut() = remaining;
            }
        }
    }

    /// Delete `content` once no stored file refers to it and no upload of it
    /// is in flight. Runs as the last step of `tx`; the removed bytes go to
    /// `removed` so they can be put back if the transaction does not commit.
    fn drop_blob(&self, tx: &dyn GraphTx, content: &Digest, removed: &mut Vec<Vec<u8>>) -> Result<()> {
        if tx.content_references(content)? > 0 {
            return Ok(());
        }
        match self.uploads.entry(*content) {
            Entry::Occupied(_) => {
                debug!(content = %content.short(), "Blob upload in flight, keeping it");
                Ok(())
            }
            Entry::Vacant(_slot) => {
                let bytes = self.blobs.get(content).ok();
                self.blobs.delete(content)?;
                removed.extend(bytes);
                Ok(())
            }
        }
    }

    fn restore_blobs(&self, removed: Vec<Vec<u8>>) {
        for bytes in removed {
            if let Err(e) = self.blobs.put(&bytes) {
                error!(error = %e, "Failed to restore blob after rollback");
            }
        }
    }

    /// Record the exhausted message on the account for quota errors.
    fn note_exhausted(&self, context: &Digest, account_id: &str, err: &GripError) {
        let GripError::QuotaExhausted { needed, reclaimable, .. } = err else {
            return;
        };
        if let Err(e) = self
            .store
            .transact(|tx| tx.set_account_message(account_id, &self.policy.exhausted_message))
        {
            error!(account = %account_id, error = %e, "Failed to record quota message");
        }
        error!(
            context = %context.short(),
            account = %account_id,
            needed = *needed,
            reclaimable = *reclaimable,
            "Quota exhausted"
        );
    }

    /// Quarantine on dependency problems; pass every error through.
    fn reject(&self, file: &ContextFile, err: GripError) -> GripError {
        if let GripError::DependencyProblem { fault, .. } = &err {
            let reason = fault.to_string();
            if let Err(qe) = self.store.transact(|tx| tx.quarantine(file, &reason)) {
                error!(file = %file.data_dep_dig().short(), error = %qe, "Failed to quarantine context file");
            } else {
                warn!(file = %file.data_dep_dig().short(), reason = %reason, "Quarantined context file");
            }
        }
        err
    }

    /// Free at least `bytes` from `context`, or nothing at all.
    pub fn reclaim(&self, context: &Digest, bytes: u64) -> Result<ReclaimReport> {
        let lock = self.context_lock(context);
        let _guard = lock
            .lock()
            .map_err(|e| GripError::Internal(format!("Lock poisoned: {}", e)))?;

        let account_id = self
            .store
            .transact(|tx| tx.context_account(context))?
            .ok_or(GripError::UnknownContext(*context))?;

        let mut report = ReclaimReport {
            requested: bytes,
            ..Default::default()
        };
        let mut skip: HashSet<Digest> = HashSet::new();

        while report.freed < bytes {
            let remaining = bytes - report.freed;
            let plan = self
                .store
                .dry_run(|tx| reclaim::sweep(tx, context, remaining, &self.policy, &skip))?;
            let reclaimable = reclaim::freed_bytes(&plan);

            if reclaimable < remaining {
                let err = reclaim::quota_exhausted(&account_id, remaining, reclaimable);
                self.note_exhausted(context, &account_id, &err);
                return Err(err);
            }

            for planned in &plan {
                match self.evict(&account_id, planned) {
                    Ok(eviction) => {
                        log_eviction(context, &eviction);
                        report.freed = report.freed.saturating_add(eviction.size);
                        report.evictions.push(eviction);
                    }
                    Err(e) => {
                        let victim = planned.tombstone.data_dep_dig;
                        warn!(file = %victim.short(), error = %e, "Eviction failed, re-planning without it");
                        skip.insert(victim);
                        report.skipped.push(victim);
                        break;
                    }
                }
            }
        }

        if !report.evictions.is_empty() {
            info!(
                context = %context.short(),
                requested = bytes,
                freed = report.freed,
                evicted = report.evictions.len(),
                "Reclaimed space"
            );
        }
        Ok(report)
    }

    /// Replay one planned eviction in its own transaction.
    fn evict(&self, account_id: &str, planned: &Eviction) -> Result<Eviction> {
        let victim_dig = planned.tombstone.data_dep_dig;
        let mut removed = Vec::new();

        let result = self.store.transact(|tx| {
            let victim = tx
                .context_file(&victim_dig)?
                .ok_or_else(|| GripError::NotFound(format!("context file {}", victim_dig.short())))?;
            if !planned.tier.admits(&victim) {
                return Err(GripError::GraphInconsistency(format!(
                    "{} no longer belongs to tier {}",
                    victim_dig.short(),
                    planned.tier
                )));
            }

            let eviction = reclaim::retire(tx, &victim, planned.tier)?;

            let account = tx
                .account(account_id)?
                .ok_or_else(|| GripError::UnknownAccount(account_id.to_string()))?;
            tx.set_disk_space_used(account_id, account.disk_space_used.saturating_sub(eviction.size))?;

            self.drop_blob(&*tx, &eviction.content, &mut removed)?;
            Ok(eviction)
        });

        if result.is_err() {
            self.restore_blobs(removed);
        }
        result
    }

    pub fn context(&self, dig: &Digest) -> Result<Option<Context>> {
        self.store.transact(|tx| tx.context(dig))
    }

    pub fn contexts(&self) -> Result<Vec<Context>> {
        self.store.transact(|tx| tx.contexts())
    }

    pub fn context_file(&self, data_dep_dig: &Digest) -> Result<Option<ContextFileWrap>> {
        self.store.transact(|tx| tx.context_file(data_dep_dig))
    }

    pub fn context_files(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        self.store.transact(|tx| tx.context_files(context))
    }

    pub fn heads(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        self.store.transact(|tx| tx.context_heads(context))
    }

    pub fn tombstones(&self, context: &Digest) -> Result<Vec<DeletedContextFile>> {
        self.store.transact(|tx| tx.tombstones(context))
    }

    pub fn quarantined(&self, context: &Digest) -> Result<Vec<QuarantinedFile>> {
        self.store.transact(|tx| tx.quarantined(context))
    }

    pub fn status(&self, context: &Digest) -> Result<ContextStatus> {
        self.store.transact(|tx| {
            let ctx = tx.context(context)?.ok_or(GripError::UnknownContext(*context))?;
            let account_id = tx
                .context_account(context)?
                .ok_or(GripError::UnknownContext(*context))?;
            let account = tx
                .account(&account_id)?
                .ok_or(GripError::UnknownAccount(account_id))?;
            let files = tx.context_files(context)?;

            Ok(ContextStatus {
                context: ctx,
                account,
                files: files.len(),
                heads: files.iter().filter(|f| f.wrap.head).count(),
                leaves: files.iter().filter(|f| f.wrap.leaf).count(),
                covered: files.iter().filter(|f| f.wrap.covered_by_snapshot).count(),
                unconstructable: files.iter().filter(|f| f.wrap.unconstructable).count(),
                bytes: files.iter().map(|f| f.file.size()).sum(),
                tombstones: tx.tombstones(context)?.len(),
                quarantined: tx.quarantined(context)?.len(),
            })
        })
    }
}

fn log_eviction(context: &Digest, eviction: &Eviction) {
    let file = eviction.tombstone.data_dep_dig;
    debug!(
        context = %context.short(),
        file = %file.short(),
        tier = %eviction.tier,
        size = eviction.size,
        "Retired context file"
    );
    if eviction.tier.is_damaging() {
        warn!(file = %file.short(), tier = %eviction.tier, size = eviction.size, "Discarded uncovered history");
    }
    for dig in &eviction.unconstructable {
        warn!(file = %dig.short(), "Context file is no longer constructable");
    }
}

fn preflight(tx: &mut dyn GraphTx, file: &ContextFile) -> Result<Preflight> {
    if tx.context(file.context())?.is_none() {
        return Err(GripError::UnknownContext(*file.context()));
    }
    if tx.context_file(file.data_dep_dig())?.is_some() {
        return Ok(Preflight::AlreadyStored);
    }
    if tx.tombstone(file.data_dep_dig())?.is_some() {
        return Ok(Preflight::PreviouslyDiscarded);
    }

    let account_id = tx
        .context_account(file.context())?
        .ok_or(GripError::UnknownContext(*file.context()))?;
    let account = tx
        .account(&account_id)?
        .ok_or_else(|| GripError::UnknownAccount(account_id.clone()))?;
    if !account.enabled {
        return Err(GripError::AccountDisabled(account_id));
    }

    graph::check(tx, file)?;

    Ok(Preflight::Ready {
        shortfall: account.shortfall(file.size()),
        account_id,
    })
}
