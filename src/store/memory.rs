//! In-memory store
//!
//! Each transaction works on a private copy of the state and swaps it in
//! on commit. Cheap enough for tests and small embedded graphs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::crypto::Digest;
use crate::error::{GripError, Result};
use crate::graph::{ContextFileWrap, WrapFields};
use crate::record::{unix_millis, Account, Context, ContextFile, DeletedContextFile};

use super::{GraphTx, QuarantinedFile, Store};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    contexts: BTreeMap<Digest, (Context, String)>,
    files: BTreeMap<Digest, ContextFileWrap>,
    /// dependency -> files listing it
    dependents: HashMap<Digest, BTreeSet<Digest>>,
    tombstones: BTreeMap<Digest, DeletedContextFile>,
    quarantine: BTreeMap<Digest, QuarantinedFile>,
    accounts: BTreeMap<String, Account>,
}

impl MemoryState {
    fn select<P>(&self, context: &Digest, pred: P) -> Vec<ContextFileWrap>
    where
        P: Fn(&ContextFileWrap) -> bool,
    {
        self.files
            .values()
            .filter(|w| w.file.context() == context && pred(w))
            .cloned()
            .collect()
    }

    fn account_mut(&mut self, account_id: &str) -> Result<&mut Account> {
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| GripError::UnknownAccount(account_id.to_string()))
    }
}

/// Graph store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run<T, F>(&self, f: F, commit: bool) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| GripError::Internal(format!("Lock poisoned: {}", e)))?;
        let mut tx = MemoryTx {
            state: state.clone(),
        };
        let out = f(&mut tx)?;
        if commit {
            *state = tx.state;
        }
        Ok(out)
    }
}

impl Store for MemoryStore {
    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        self.run(f, true)
    }

    fn dry_run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        self.run(f, false)
    }
}

struct MemoryTx {
    state: MemoryState,
}

impl GraphTx for MemoryTx {
    fn context(&self, dig: &Digest) -> Result<Option<Context>> {
        Ok(self.state.contexts.get(dig).map(|(c, _)| c.clone()))
    }

    fn store_context(&mut self, context: &Context, account_id: &str) -> Result<()> {
        self.state
            .contexts
            .insert(*context.dig(), (context.clone(), account_id.to_string()));
        Ok(())
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        Ok(self.state.contexts.values().map(|(c, _)| c.clone()).collect())
    }

    fn context_account(&self, context: &Digest) -> Result<Option<String>> {
        Ok(self.state.contexts.get(context).map(|(_, a)| a.clone()))
    }

    fn context_file(&self, data_dep_dig: &Digest) -> Result<Option<ContextFileWrap>> {
        Ok(self.state.files.get(data_dep_dig).cloned())
    }

    fn dependents_of(&self, context: &Digest, data_dep_dig: &Digest) -> Result<Vec<ContextFileWrap>> {
        let Some(digs) = self.state.dependents.get(data_dep_dig) else {
            return Ok(Vec::new());
        };
        Ok(digs
            .iter()
            .filter_map(|d| self.state.files.get(d))
            .filter(|w| w.file.context() == context)
            .cloned()
            .collect())
    }

    fn context_files(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        Ok(self.state.select(context, |_| true))
    }

    fn context_heads(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        Ok(self.state.select(context, |w| w.wrap.head))
    }

    fn context_leaves(
        &self,
        context: &Digest,
        covered: bool,
        index: Option<bool>,
    ) -> Result<Vec<ContextFileWrap>> {
        Ok(self.state.select(context, |w| {
            w.wrap.leaf
                && w.wrap.covered_by_snapshot == covered
                && index.map_or(true, |i| w.file.is_index() == i)
        }))
    }

    fn covered_snapshots(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        Ok(self
            .state
            .select(context, |w| w.file.is_snapshot() && w.wrap.covered_by_snapshot))
    }

    fn insert_context_file(&mut self, file: &ContextFile, wrap: &WrapFields) -> Result<()> {
        let dig = *file.data_dep_dig();
        for dep in file.depends_on() {
            self.state.dependents.entry(*dep).or_default().insert(dig);
        }
        self.state.files.insert(
            dig,
            ContextFileWrap {
                file: file.clone(),
                wrap: *wrap,
            },
        );
        Ok(())
    }

    fn update_wrap(&mut self, data_dep_dig: &Digest, wrap: &WrapFields) -> Result<()> {
        let stored = self
            .state
            .files
            .get_mut(data_dep_dig)
            .ok_or_else(|| GripError::NotFound(format!("context file {}", data_dep_dig.short())))?;
        stored.wrap = *wrap;
        Ok(())
    }

    fn delete_context_file(&mut self, data_dep_dig: &Digest) -> Result<()> {
        let Some(removed) = self.state.files.remove(data_dep_dig) else {
            return Ok(());
        };
        for dep in removed.file.depends_on() {
            if let Some(set) = self.state.dependents.get_mut(dep) {
                set.remove(data_dep_dig);
                if set.is_empty() {
                    self.state.dependents.remove(dep);
                }
            }
        }
        Ok(())
    }

    fn content_references(&self, content: &Digest) -> Result<u64> {
        Ok(self
            .state
            .files
            .values()
            .filter(|w| w.file.content() == content)
            .count() as u64)
    }

    fn append_tombstone(&mut self, tombstone: &DeletedContextFile) -> Result<()> {
        self.state
            .tombstones
            .insert(tombstone.data_dep_dig, tombstone.clone());
        Ok(())
    }

    fn tombstone(&self, data_dep_dig: &Digest) -> Result<Option<DeletedContextFile>> {
        Ok(self.state.tombstones.get(data_dep_dig).cloned())
    }

    fn tombstones(&self, context: &Digest) -> Result<Vec<DeletedContextFile>> {
        Ok(self
            .state
            .tombstones
            .values()
            .filter(|t| &t.context == context)
            .cloned()
            .collect())
    }

    fn quarantine(&mut self, file: &ContextFile, reason: &str) -> Result<()> {
        self.state.quarantine.insert(
            *file.data_dep_dig(),
            QuarantinedFile {
                file: file.clone(),
                reason: reason.to_string(),
                quarantined_at: unix_millis(),
            },
        );
        Ok(())
    }

    fn quarantined(&self, context: &Digest) -> Result<Vec<QuarantinedFile>> {
        Ok(self
            .state
            .quarantine
            .values()
            .filter(|q| q.file.context() == context)
            .cloned()
            .collect())
    }

    fn store_account(&mut self, account: &Account) -> Result<()> {
        self.state
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    fn account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self.state.accounts.get(account_id).cloned())
    }

    fn set_disk_space_used(&mut self, account_id: &str, used: u64) -> Result<()> {
        self.state.account_mut(account_id)?.disk_space_used = used;
        Ok(())
    }

    fn set_account_message(&mut self, account_id: &str, message: &str) -> Result<()> {
        self.state.account_mut(account_id)?.message = message.to_string();
        Ok(())
    }
}
