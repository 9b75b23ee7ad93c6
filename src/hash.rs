//! Hashing primitives shared by the fingerprint engine, file hasher, and
//! content-addressed cache.

use color_eyre::Result;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{fs, path::AbsFilePath};

/// A BLAKE3 hash, rendered as lowercase hex.
///
/// This is the key type for the content-addressed store (`cache::archive`)
/// and the digest primitive behind [`crate::fingerprint::Fingerprint`]
/// (which truncates it to 16 hex characters per the spec's fingerprint
/// format).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct Blake3(String);

impl Blake3 {
    /// Hash the contents of the file at the specified path.
    #[instrument(name = "Blake3::from_file")]
    pub async fn from_file(path: &AbsFilePath) -> Result<Self> {
        let bytes = fs::must_read_buffered(path).await?;
        Ok(Self::from_buffer(bytes))
    }

    /// Hash the contents of a buffer.
    #[instrument(skip_all, name = "Blake3::from_buffer")]
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let hash = blake3::hash(buffer);
        let hash = hex::encode(hash.as_bytes());
        trace!(?hash, bytes = ?buffer.len(), "hash buffer");
        Self(hash)
    }

    /// Hash the contents of the iterator in order, each field delimited so
    /// that `["ab", "c"]` and `["a", "bc"]` never collide.
    #[instrument(skip_all, name = "Blake3::from_fields")]
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut bytes = 0;
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
            bytes += field.len();
        }
        let hash = hasher.finalize();
        let hash = hex::encode(hash.as_bytes());
        trace!(?hash, ?bytes, "hash fields");
        Self(hash)
    }

    /// Compute a keyed MAC over the buffer using the provided 32-byte key.
    /// Used for optional cache-archive signing (§4.3).
    #[instrument(skip_all, name = "Blake3::keyed_mac")]
    pub fn keyed_mac(key: &[u8; 32], buffer: impl AsRef<[u8]>) -> Self {
        let hash = blake3::keyed_hash(key, buffer.as_ref());
        Self(hex::encode(hash.as_bytes()))
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncate to the first `n` hex characters. Used to produce the
    /// spec's 16-hex-character fingerprint from a full BLAKE3 digest.
    pub fn truncated(&self, n: usize) -> String {
        self.0.chars().take(n).collect()
    }
}

impl From<&Blake3> for Blake3 {
    fn from(hash: &Blake3) -> Self {
        hash.clone()
    }
}

impl AsRef<str> for Blake3 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Blake3 {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl AsRef<Blake3> for Blake3 {
    fn as_ref(&self) -> &Blake3 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fields_is_unambiguous() {
        let a = Blake3::from_fields(["ab", "c"]);
        let b = Blake3::from_fields(["a", "bc"]);
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn from_fields_is_order_sensitive() {
        let a = Blake3::from_fields(["x", "y"]);
        let b = Blake3::from_fields(["y", "x"]);
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn from_buffer_is_deterministic() {
        let a = Blake3::from_buffer(b"hello world");
        let b = Blake3::from_buffer(b"hello world");
        assert_eq!(a.as_str(), b.as_str());
    }
}
