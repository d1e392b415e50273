//! Context files - the nodes of the dependency graph
//!
//! A context file carries two digests:
//! - `data_dep_dig` covers the content and the structural fields (flags,
//!   dependency set, owning context). Other files reference it in their
//!   `depends_on` lists, so it is the identity used by the graph.
//! - `dig` covers `data_dep_dig` plus authorship (node, login, timestamp)
//!   and is what gets signed.

use serde::{Deserialize, Serialize};

use crate::crypto::{hex_bytes, Digest, DigestBuilder, NodeId, Signer};

use super::unix_millis;

/// An immutable file contribution to a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    context: Digest,
    path: String,
    content: Digest,
    size: u64,
    index: bool,
    snapshot: bool,
    depends_on: Vec<Digest>,
    #[serde(default)]
    context_user: Option<String>,
    node_id: NodeId,
    created_on: u64,
    data_dep_dig: Digest,
    dig: Digest,
    #[serde(with = "hex_bytes")]
    sig: Vec<u8>,
}

impl ContextFile {
    /// Start building a file for `context` whose content hashes to `content`.
    pub fn builder(context: Digest, content: Digest, size: u64) -> ContextFileBuilder {
        ContextFileBuilder {
            context,
            path: String::new(),
            content,
            size,
            index: false,
            snapshot: false,
            depends_on: Vec::new(),
            context_user: None,
            created_on: None,
        }
    }

    pub fn context(&self) -> &Digest {
        &self.context
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn content(&self) -> &Digest {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_index(&self) -> bool {
        self.index
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn depends_on(&self) -> &[Digest] {
        &self.depends_on
    }

    pub fn context_user(&self) -> Option<&str> {
        self.context_user.as_deref()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn created_on(&self) -> u64 {
        self.created_on
    }

    pub fn data_dep_dig(&self) -> &Digest {
        &self.data_dep_dig
    }

    pub fn dig(&self) -> &Digest {
        &self.dig
    }

    pub fn sig(&self) -> &[u8] {
        &self.sig
    }

    /// Does this file list `data_dep_dig` among its dependencies?
    pub fn does_depend_on(&self, data_dep_dig: &Digest) -> bool {
        self.depends_on.iter().any(|d| d == data_dep_dig)
    }

    /// Recompute `(data_dep_dig, dig)` from the fields.
    pub(crate) fn compute_digests(&self) -> (Digest, Digest) {
        let data_dep_dig = DigestBuilder::new()
            .bool(self.index)
            .bool(self.snapshot)
            .digest_set(&self.depends_on)
            .digest(&self.context)
            .str(&self.path)
            .digest(&self.content)
            .u64(self.size)
            .finish();
        let dig = DigestBuilder::new()
            .digest(&data_dep_dig)
            .str(self.context_user.as_deref().unwrap_or_default())
            .bytes(self.node_id.as_bytes())
            .u64(self.created_on)
            .finish();
        (data_dep_dig, dig)
    }
}

/// Builder for new context files; signing is the final step.
#[derive(Debug, Clone)]
pub struct ContextFileBuilder {
    context: Digest,
    path: String,
    content: Digest,
    size: u64,
    index: bool,
    snapshot: bool,
    depends_on: Vec<Digest>,
    context_user: Option<String>,
    created_on: Option<u64>,
}

impl ContextFileBuilder {
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn index(mut self, index: bool) -> Self {
        self.index = index;
        self
    }

    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Append a dependency on the file with data digest `dep`.
    pub fn depends_on(mut self, dep: Digest) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn context_user(mut self, user: impl Into<String>) -> Self {
        self.context_user = Some(user.into());
        self
    }

    pub fn created_on(mut self, created_on: u64) -> Self {
        self.created_on = Some(created_on);
        self
    }

    /// Compute both digests and sign as `signer`.
    pub fn sign(self, signer: &dyn Signer) -> ContextFile {
        let mut file = ContextFile {
            context: self.context,
            path: self.path,
            content: self.content,
            size: self.size,
            index: self.index,
            snapshot: self.snapshot,
            depends_on: self.depends_on,
            context_user: self.context_user,
            node_id: signer.node_id(),
            created_on: self.created_on.unwrap_or_else(unix_millis),
            data_dep_dig: Digest::of(&[]),
            dig: Digest::of(&[]),
            sig: Vec::new(),
        };
        let (data_dep_dig, dig) = file.compute_digests();
        file.data_dep_dig = data_dep_dig;
        file.dig = dig;
        file.sig = signer.sign(dig.as_bytes());
        file
    }
}
