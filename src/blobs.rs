//! Content-addressed blob storage
//!
//! Context file content lives outside the graph database, keyed by its
//! SHA-512 digest. Blobs are shared: two files with the same content point
//! at the same blob, so a blob is only deleted once no stored file
//! references it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::crypto::Digest;
use crate::error::{GripError, Result};

/// Storage for content blobs.
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its digest. Storing existing content is a no-op.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    fn exists(&self, digest: &Digest) -> Result<bool>;

    fn size(&self, digest: &Digest) -> Result<u64>;

    /// Remove a blob; removing a missing blob succeeds.
    fn delete(&self, digest: &Digest) -> Result<()>;
}

/// Blob store on the local filesystem
pub struct FsBlobStore {
    root_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a new blob store at the given directory
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_dir)?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    /// Get path for a blob by digest
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        // First 4 hex chars as subdirectory for filesystem distribution
        let hex = digest.to_hex();
        self.root_dir.join("blobs").join(&hex[..4]).join(hex)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let path = self.blob_path(&digest);
        if path.exists() {
            debug!(digest = %digest.short(), "Blob already exists");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to temp file then rename so readers never see partial blobs
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;

        debug!(digest = %digest.short(), size = data.len(), "Stored blob");
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        match std::fs::read(&path) {
            Ok(data) => {
                let actual = Digest::of(&data);
                if &actual != digest {
                    return Err(GripError::DigestMismatch {
                        expected: digest.to_hex(),
                        actual: actual.to_hex(),
                    });
                }
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GripError::NotFound(format!("blob {}", digest.short())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }

    fn size(&self, digest: &Digest) -> Result<u64> {
        match std::fs::metadata(self.blob_path(digest)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GripError::NotFound(format!("blob {}", digest.short())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        match std::fs::remove_file(self.blob_path(digest)) {
            Ok(()) => {
                debug!(digest = %digest.short(), "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blob store held in memory (for tests)
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Digest, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|e| GripError::Internal(format!("Lock poisoned: {}", e)))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        self.lock()?.entry(digest).or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.lock()?
            .get(digest)
            .cloned()
            .ok_or_else(|| GripError::NotFound(format!("blob {}", digest.short())))
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.lock()?.contains_key(digest))
    }

    fn size(&self, digest: &Digest) -> Result<u64> {
        self.lock()?
            .get(digest)
            .map(|b| b.len() as u64)
            .ok_or_else(|| GripError::NotFound(format!("blob {}", digest.short())))
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        self.lock()?.remove(digest);
        Ok(())
    }
}
