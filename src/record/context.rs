//! Context records

use serde::{Deserialize, Serialize};

use crate::crypto::{hex_bytes, Digest, DigestBuilder, NodeId, Signer};

use super::unix_millis;

/// A named change history created by exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    name: String,
    node_id: NodeId,
    created_on: u64,
    dig: Digest,
    #[serde(with = "hex_bytes")]
    sig: Vec<u8>,
}

impl Context {
    /// Create and sign a new context owned by `signer`.
    pub fn new(name: impl Into<String>, signer: &dyn Signer) -> Self {
        Self::with_created_on(name, unix_millis(), signer)
    }

    pub fn with_created_on(name: impl Into<String>, created_on: u64, signer: &dyn Signer) -> Self {
        let mut ctx = Self {
            name: name.into(),
            node_id: signer.node_id(),
            created_on,
            dig: Digest::of(&[]),
            sig: Vec::new(),
        };
        ctx.dig = ctx.compute_dig();
        ctx.sig = signer.sign(ctx.dig.as_bytes());
        ctx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn created_on(&self) -> u64 {
        self.created_on
    }

    pub fn dig(&self) -> &Digest {
        &self.dig
    }

    pub fn sig(&self) -> &[u8] {
        &self.sig
    }

    pub(crate) fn compute_dig(&self) -> Digest {
        DigestBuilder::new()
            .str(&self.name)
            .bytes(self.node_id.as_bytes())
            .u64(self.created_on)
            .finish()
    }
}
