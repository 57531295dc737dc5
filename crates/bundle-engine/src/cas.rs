//! Content-addressable store: blobs on disk named by their hex digest.

use crate::error::{EngineError, Result};
use crate::hash::{self, FileHash};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory of blobs keyed by SHA-256 digest.
///
/// Inserts are atomic and idempotent: a blob either fully lands under its
/// final name or never appears, and re-inserting existing content is a
/// no-op. Concurrent readers may therefore resolve blobs at any time.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(EngineError::fs)?;
        Ok(ContentStore { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The stable path a blob with this hash occupies, whether or not it
    /// currently exists.
    pub fn blob_path(&self, hash: &FileHash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    /// Whether a blob with this hash is present.
    pub fn contains(&self, hash: &FileHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// The blob's path, if it exists.
    pub fn path_of(&self, hash: &FileHash) -> Option<PathBuf> {
        let path = self.blob_path(hash);
        path.is_file().then_some(path)
    }

    /// Move a fully written temp file into the store.
    ///
    /// The temp file is rehashed first; on mismatch it is deleted and the
    /// insert fails with a non-retryable error. If the destination already
    /// exists the temp file is discarded and the insert succeeds.
    pub async fn insert_from(&self, temp: PathBuf, expected: &FileHash) -> Result<PathBuf> {
        let actual = hash::hash_file(&temp).await.map_err(EngineError::fs)?;
        if actual != *expected {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(EngineError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let dest = self.blob_path(expected);
        if dest.is_file() {
            let _ = tokio::fs::remove_file(&temp).await;
            return Ok(dest);
        }

        if let Err(rename_err) = tokio::fs::rename(&temp, &dest).await {
            // A concurrent insert of the same blob may have won the rename.
            if dest.is_file() {
                let _ = tokio::fs::remove_file(&temp).await;
                return Ok(dest);
            }
            // Cross-filesystem temp dir: fall back to copy-then-delete.
            debug!(error = %rename_err, blob = %expected, "rename failed, copying instead");
            tokio::fs::copy(&temp, &dest).await.map_err(EngineError::fs)?;
            let _ = tokio::fs::remove_file(&temp).await;
        }
        Ok(dest)
    }

    /// Delete a blob; returns whether it existed.
    pub async fn delete(&self, hash: &FileHash) -> bool {
        tokio::fs::remove_file(self.blob_path(hash)).await.is_ok()
    }

    /// Enumerate every blob currently stored.
    ///
    /// Entries whose names are not well-formed digests are ignored.
    pub fn list_hashes(&self) -> Result<Vec<FileHash>> {
        let mut hashes = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(EngineError::fs)? {
            let entry = entry.map_err(EngineError::fs)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(hash) = FileHash::parse_hex(name) {
                    hashes.push(hash);
                }
            }
        }
        Ok(hashes)
    }

    /// Streaming digest of an arbitrary file.
    pub async fn hash_of(&self, path: &Path) -> Result<FileHash> {
        hash::hash_file(path).await.map_err(EngineError::fs)
    }
}
