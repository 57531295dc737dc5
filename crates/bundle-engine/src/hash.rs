//! Streaming SHA-256 hashing and the `sha256:<hex>` digest type.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

/// The only digest algorithm the manifest format carries.
pub const HASH_ALGORITHM: &str = "sha256";

const READ_BUF_SIZE: usize = 64 * 1024;

/// A SHA-256 digest identifying one blob's content.
///
/// String form is `sha256:<64 lowercase hex>`; equality is byte-equality of
/// the digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHash([u8; 32]);

impl FileHash {
    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        FileHash(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        FileHash(Sha256::digest(data).into())
    }

    /// Lowercase hex rendering of the digest, without the algorithm tag.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a bare 64-character digest.
    ///
    /// Manifest hashes are canonical lowercase hex; uppercase input is
    /// rejected rather than normalized.
    pub fn parse_hex(value: &str) -> Result<Self> {
        if value.len() != 64
            || !value
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(EngineError::ManifestInvalid(format!(
                "malformed sha256 digest: {value:?}"
            )));
        }
        let raw = hex::decode(value)
            .map_err(|err| EngineError::ManifestInvalid(format!("malformed digest: {err}")))?;
        let array: [u8; 32] = raw
            .try_into()
            .map_err(|_| EngineError::ManifestInvalid("digest must be 32 bytes".into()))?;
        Ok(FileHash(array))
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_ALGORITHM}:{}", self.to_hex())
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({HASH_ALGORITHM}:{})", self.to_hex())
    }
}

impl FromStr for FileHash {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix("sha256:").ok_or_else(|| {
            EngineError::ManifestInvalid(format!("unsupported hash algorithm in {s:?}"))
        })?;
        Self::parse_hex(hex_part)
    }
}

impl Serialize for FileHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FileHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher used while a byte stream is being written elsewhere.
#[derive(Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    /// Start a fresh digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Finish, returning the digest and the total byte count fed.
    pub fn finalize(self) -> (FileHash, u64) {
        (FileHash(self.inner.finalize().into()), self.bytes)
    }
}

/// Hash a file's contents without loading it into memory.
pub async fn hash_file(path: &Path) -> std::io::Result<FileHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(FileHash(hasher.finalize().into()))
}
