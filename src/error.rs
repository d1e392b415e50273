//! Error types for grip-node

use thiserror::Error;

use crate::crypto::Digest;

/// Why a candidate context file was refused entry to the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyFault {
    /// The file lists its own data digest as a dependency
    SelfReference,

    /// The same dependency digest appears more than once
    DuplicateDependency(Digest),

    /// Following stored dependencies from this digest leads back to the candidate
    Cycle(Digest),

    /// A file without dependencies that is not a self-sufficient snapshot
    RootNotSnapshot,
}

impl std::fmt::Display for DependencyFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyFault::SelfReference => write!(f, "file depends on itself"),
            DependencyFault::DuplicateDependency(d) => write!(f, "dependency {} listed twice", d),
            DependencyFault::Cycle(d) => write!(f, "dependency loop through {}", d),
            DependencyFault::RootNotSnapshot => {
                write!(f, "file without dependencies must be a snapshot")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum GripError {
    #[error("Dependency problem in {data_dep_dig}: {fault}")]
    DependencyProblem {
        data_dep_dig: Digest,
        fault: DependencyFault,
    },

    #[error("Graph inconsistency: {0}")]
    GraphInconsistency(String),

    #[error("Quota exhausted for account {account_id}: needed {needed} bytes, only {reclaimable} reclaimable")]
    QuotaExhausted {
        account_id: String,
        needed: u64,
        reclaimable: u64,
    },

    #[error("Unknown context: {0}")]
    UnknownContext(Digest),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Account is not enabled: {0}")]
    AccountDisabled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Signature error: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = GripError> = std::result::Result<T, E>;
