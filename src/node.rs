//! Async node facade
//!
//! Wraps the blocking [`Engine`] for use from the tokio runtime. Records
//! arriving from peers are verified here before the engine sees them;
//! local contributions are stored, signed and admitted in one call.

use std::sync::Arc;

use tracing::{debug, info};

use crate::blobs::BlobStore;
use crate::crypto::{Digest, NodeId, Signer, Verifier};
use crate::engine::{Admission, ContextStatus, Engine};
use crate::error::{GripError, Result};
use crate::graph::ContextFileWrap;
use crate::reclaim::ReclaimReport;
use crate::record::{Context, ContextFile, SignedRecord};
use crate::store::Store;

/// What happened to a record handed to [`GripNode::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Context(Digest),
    ContextFile(Admission),
}

/// A new file authored on this node.
#[derive(Debug, Clone, Default)]
pub struct Contribution {
    pub path: String,
    pub data: Vec<u8>,
    pub index: bool,
    pub snapshot: bool,
    pub depends_on: Vec<Digest>,
    pub context_user: Option<String>,
}

pub struct GripNode<S: Store + 'static, B: BlobStore + 'static> {
    engine: Arc<Engine<S, B>>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    account_id: String,
}

impl<S: Store + 'static, B: BlobStore + 'static> GripNode<S, B> {
    /// `account_id` is charged for contexts received or created here.
    pub fn new(
        engine: Engine<S, B>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            signer,
            verifier,
            account_id: account_id.into(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.signer.node_id()
    }

    pub fn engine(&self) -> &Arc<Engine<S, B>> {
        &self.engine
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Engine<S, B>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| GripError::Internal(format!("Engine task failed: {}", e)))?
    }

    /// Verify a record from a peer and hand it to the engine.
    pub async fn receive(&self, record: SignedRecord) -> Result<Received> {
        record.verify(self.verifier.as_ref())?;
        debug!(dig = %record.dig().short(), from = %record.node_id(), "Verified record");

        match record {
            SignedRecord::Context(context) => {
                let account_id = self.account_id.clone();
                self.blocking(move |engine| {
                    engine.register_context(&context, &account_id)?;
                    Ok(Received::Context(*context.dig()))
                })
                .await
            }
            SignedRecord::ContextFile(file) => self
                .blocking(move |engine| engine.admit(&file))
                .await
                .map(Received::ContextFile),
        }
    }

    /// Create and register a context owned by this node.
    pub async fn create_context(&self, name: &str) -> Result<Context> {
        let context = Context::new(name, self.signer.as_ref());
        let account_id = self.account_id.clone();
        let registered = context.clone();
        self.blocking(move |engine| engine.register_context(&registered, &account_id))
            .await?;
        info!(context = %context.dig().short(), name = %name, "Created context");
        Ok(context)
    }

    /// Store the content, sign a new context file and admit it.
    ///
    /// The blob is dropped again if admission fails and nothing else
    /// references it. See [`Engine::admit_content`].
    pub async fn contribute(
        &self,
        context: Digest,
        contribution: Contribution,
    ) -> Result<(ContextFile, Admission)> {
        let signer = Arc::clone(&self.signer);
        self.blocking(move |engine| {
            let Contribution {
                path,
                data,
                index,
                snapshot,
                depends_on,
                context_user,
            } = contribution;
            let size = data.len() as u64;

            engine.admit_content(&data, |content| {
                let mut builder = ContextFile::builder(context, content, size)
                    .path(path)
                    .index(index)
                    .snapshot(snapshot);
                for dep in depends_on {
                    builder = builder.depends_on(dep);
                }
                if let Some(user) = context_user {
                    builder = builder.context_user(user);
                }
                builder.sign(signer.as_ref())
            })
        })
        .await
    }

    pub async fn reclaim(&self, context: Digest, bytes: u64) -> Result<ReclaimReport> {
        self.blocking(move |engine| engine.reclaim(&context, bytes)).await
    }

    pub async fn heads(&self, context: Digest) -> Result<Vec<ContextFileWrap>> {
        self.blocking(move |engine| engine.heads(&context)).await
    }

    pub async fn status(&self, context: Digest) -> Result<ContextStatus> {
        self.blocking(move |engine| engine.status(&context)).await
    }
}
