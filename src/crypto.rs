//! Digests and node signatures
//!
//! Every record is addressed by a SHA-512 digest over its canonical fields.
//! Signing is behind the [`Signer`]/[`Verifier`] pair so the dependency
//! engine never touches key material; the node ships an ed25519
//! implementation of both.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha512};
use tracing::info;

use crate::error::GripError;

/// Length in bytes of a record digest (SHA-512)
pub const DIGEST_LEN: usize = 64;

/// Content digest used as the address of every record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GripError> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            GripError::InvalidDigest(format!("expected {} bytes, got {}", DIGEST_LEN, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, GripError> {
        let bytes = hex::decode(s).map_err(|e| GripError::InvalidDigest(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Digest of raw content bytes.
    pub fn of(data: &[u8]) -> Self {
        DigestBuilder::new().bytes(data).finish()
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    fn xor_in(&mut self, other: &Digest) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= *b;
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-512 over the canonical encoding of a record.
///
/// Integers are written big-endian and booleans as a single byte, so two
/// nodes hashing the same fields always agree.
pub struct DigestBuilder(Sha512);

impl DigestBuilder {
    pub fn new() -> Self {
        Self(Sha512::new())
    }

    pub fn bool(mut self, v: bool) -> Self {
        self.0.update([v as u8]);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.0.update(v.to_be_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.update(v.to_be_bytes());
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.0.update(v);
        self
    }

    pub fn str(self, v: &str) -> Self {
        self.bytes(v.as_bytes())
    }

    pub fn digest(self, v: &Digest) -> Self {
        self.bytes(v.as_bytes())
    }

    /// Hash a set of digests independently of their order.
    ///
    /// The count is hashed first, then the XOR fold of every member.
    pub fn digest_set(self, set: &[Digest]) -> Self {
        let builder = self.u32(set.len() as u32);
        if set.is_empty() {
            return builder;
        }
        let mut folded = Digest([0u8; DIGEST_LEN]);
        for d in set {
            folded.xor_in(d);
        }
        builder.digest(&folded)
    }

    pub fn finish(self) -> Digest {
        let out = self.0.finalize();
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&out);
        Digest(arr)
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a node: its ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, GripError> {
        let bytes = hex::decode(s).map_err(|e| GripError::InvalidDigest(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GripError::InvalidDigest(format!("node id must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Produces signatures on behalf of the local node.
pub trait Signer: Send + Sync {
    fn node_id(&self) -> NodeId;
    fn sign(&self, msg: &[u8]) -> Vec<u8>;
}

/// Checks a signature against the node that claims to have produced it.
pub trait Verifier: Send + Sync {
    fn verify(&self, node: &NodeId, msg: &[u8], sig: &[u8]) -> Result<(), GripError>;
}

/// ed25519 key pair of the local node.
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Load the key stored at `path`, creating a fresh one if the file is missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, GripError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let bytes = hex::decode(content.trim())
                .map_err(|e| GripError::Config(format!("bad key file {}: {}", path.display(), e)))?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| GripError::Config(format!("bad key length in {}", path.display())))?;
            return Ok(Self::from_secret(secret));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = Self::generate();
        std::fs::write(path, hex::encode(key.signing.to_bytes()))?;
        info!(path = %path.display(), node_id = %key.node_id(), "Generated node key");
        Ok(key)
    }
}

impl Signer for NodeKey {
    fn node_id(&self) -> NodeId {
        NodeId(self.signing.verifying_key().to_bytes())
    }

    fn sign(&self, msg: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

/// ed25519 signature verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, node: &NodeId, msg: &[u8], sig: &[u8]) -> Result<(), GripError> {
        let key = VerifyingKey::from_bytes(node.as_bytes())?;
        let sig = Signature::from_slice(sig)?;
        key.verify_strict(msg, &sig)?;
        Ok(())
    }
}

/// Serde helper storing byte vectors as hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_set_ignores_order() {
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");

        let ab = DigestBuilder::new().digest_set(&[a, b]).finish();
        let ba = DigestBuilder::new().digest_set(&[b, a]).finish();
        let only_a = DigestBuilder::new().digest_set(&[a]).finish();

        assert_eq!(ab, ba);
        assert_ne!(ab, only_a);
    }

    #[test]
    fn test_digest_hex_serde() {
        let d = Digest::of(b"payload");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = NodeKey::generate();
        let sig = key.sign(b"record");

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&key.node_id(), b"record", &sig).is_ok());
        assert!(verifier.verify(&key.node_id(), b"tampered", &sig).is_err());

        let other = NodeKey::generate();
        assert!(verifier.verify(&other.node_id(), b"record", &sig).is_err());
    }

    #[test]
    fn test_key_file_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = NodeKey::load_or_generate(&path).unwrap();
        let second = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }
}
