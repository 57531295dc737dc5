//! Bundle directory layout, write locking, and version materialization.
//!
//! ```text
//! bundleDir/
//!   manifest.json           # raw, signed JSON bytes of the current manifest
//!   cas/                    # content-addressable store
//!   versions/<build>/       # relative paths linking back into cas/
//!   temp/                   # in-flight downloads; always safe to purge
//! ```
//!
//! `manifest.json` is written last during finalization; its presence
//! pointing at build N is the durable "version N is usable" signal.

use crate::cas::ContentStore;
use crate::error::{EngineError, Result};
use crate::manifest::{BundleManifest, ManifestDocument};
use crate::platform::Platform;
use bytes::Bytes;
use fs2::FileExt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// File name of the on-disk manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

const LOCK_FILE: &str = ".lock";
const CAS_DIR: &str = "cas";
const VERSIONS_DIR: &str = "versions";
const TEMP_DIR: &str = "temp";

/// Owner of all mutations under one bundle directory.
///
/// Reads are free; every mutation goes through a [`WriteScope`], which holds
/// both an in-process lock and an advisory file lock so a shell-side engine
/// and a bundle-side engine sharing the directory cannot interleave writes.
/// The scope is not re-entrant.
pub struct StorageManager {
    bundle_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StorageManager {
    /// Open (creating if needed) the storage rooted at `bundle_dir`.
    pub fn open(bundle_dir: impl Into<PathBuf>) -> Result<Self> {
        let bundle_dir = bundle_dir.into();
        for dir in [
            bundle_dir.clone(),
            bundle_dir.join(CAS_DIR),
            bundle_dir.join(VERSIONS_DIR),
            bundle_dir.join(TEMP_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(EngineError::fs)?;
        }
        Ok(StorageManager {
            bundle_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.bundle_dir.join(CAS_DIR)
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.bundle_dir.join(VERSIONS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.bundle_dir.join(TEMP_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.bundle_dir.join(MANIFEST_FILE)
    }

    /// The materialized directory for one build.
    pub fn version_dir(&self, build_number: u64) -> PathBuf {
        self.versions_dir().join(build_number.to_string())
    }

    /// Read the currently installed manifest, raw bytes and parsed view.
    ///
    /// `Ok(None)` means no bundle is installed. Read failures other than
    /// absence are transient I/O and classified retryable.
    pub async fn read_manifest(&self) -> Result<Option<ManifestDocument>> {
        match tokio::fs::read(self.manifest_path()).await {
            Ok(bytes) => Ok(Some(ManifestDocument::parse(Bytes::from(bytes))?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EngineError::network(err)),
        }
    }

    /// Reserve a fresh path under `temp/` for an in-flight download.
    pub fn new_temp_path(&self) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("blob-")
            .tempfile_in(self.temp_dir())
            .map_err(EngineError::fs)?;
        file.into_temp_path()
            .keep()
            .map_err(|err| EngineError::fs(err.error))
    }

    /// Acquire the write lock and return the scope value that unlocks the
    /// mutating operations. Held for the scope's whole lifetime; dropped on
    /// scope drop.
    pub async fn write_scope(&self) -> Result<WriteScope<'_>> {
        let guard = self.write_lock.lock().await;
        let lock_path = self.bundle_dir.join(LOCK_FILE);
        let lock_file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|err| EngineError::Other(format!("lock acquisition task failed: {err}")))?
        .map_err(EngineError::fs)?;
        debug!(dir = %self.bundle_dir.display(), "write scope acquired");
        Ok(WriteScope {
            storage: self,
            lock_file,
            _guard: guard,
        })
    }
}

/// Proof of exclusive write access to the bundle directory.
///
/// All mutations of `bundleDir` outside the CAS live here.
pub struct WriteScope<'a> {
    storage: &'a StorageManager,
    lock_file: std::fs::File,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl WriteScope<'_> {
    /// Materialize `versions/<buildNumber>/` by linking every applicable
    /// file back to its CAS blob.
    ///
    /// Idempotent: links that already resolve to the right blob are left
    /// untouched, which is what lets the validator repair a partially
    /// materialized directory by re-running this.
    pub async fn prepare_version(
        &self,
        manifest: &BundleManifest,
        platform: Platform,
        cas: &ContentStore,
    ) -> Result<PathBuf> {
        let version_dir = self.storage.version_dir(manifest.build_number);
        tokio::fs::create_dir_all(&version_dir)
            .await
            .map_err(EngineError::fs)?;

        for file in manifest.files_for_platform(platform) {
            let blob = cas
                .path_of(&file.hash)
                .ok_or_else(|| EngineError::MissingFromStore(file.hash.to_string()))?;
            let dest = version_dir.join(&file.path);
            if link_is_current(&dest, &blob).await {
                continue;
            }
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(EngineError::fs)?;
            }
            remove_existing(&dest).await?;
            place_link(&dest, &blob).await?;
        }
        Ok(version_dir)
    }

    /// Atomically write the raw manifest bytes (the exact bytes whose
    /// signature was verified) to `manifest.json`.
    pub async fn save_manifest(&self, raw: &[u8]) -> Result<()> {
        let manifest_path = self.storage.manifest_path();
        let dir = self.storage.bundle_dir().to_path_buf();
        let bytes = raw.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(&bytes)?;
            temp.flush()?;
            temp.as_file().sync_all()?;
            let temp_path = temp.into_temp_path();
            match temp_path.persist(&manifest_path) {
                Ok(()) => Ok(()),
                // Windows cannot rename over an existing file.
                Err(err) => {
                    let temp_path = err.path;
                    let _ = std::fs::remove_file(&manifest_path);
                    temp_path.persist(&manifest_path).map_err(|err| err.error)
                }
            }
        })
        .await
        .map_err(|err| EngineError::Other(format!("manifest write task failed: {err}")))?
        .map_err(EngineError::fs)
    }

    /// Delete one materialized version tree.
    pub async fn delete_version(&self, build_number: u64) -> Result<()> {
        match tokio::fs::remove_dir_all(self.storage.version_dir(build_number)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::fs(err)),
        }
    }

    /// Purge everything under `temp/`; returns the number of entries
    /// removed. Individual failures are logged and skipped.
    pub async fn cleanup_temp(&self) -> Result<u64> {
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(self.storage.temp_dir())
            .await
            .map_err(EngineError::fs)?;
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::fs)? {
            let path = entry.path();
            let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to purge temp entry"),
            }
        }
        Ok(removed)
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock_file.unlock() {
            warn!(error = %err, "failed to release bundle write lock");
        }
    }
}

/// Whether `dest` already resolves to the given CAS blob.
pub(crate) async fn link_is_current(dest: &Path, blob: &Path) -> bool {
    #[cfg(unix)]
    {
        let Ok(metadata) = tokio::fs::symlink_metadata(dest).await else {
            return false;
        };
        if !metadata.file_type().is_symlink() {
            return false;
        }
        match (
            tokio::fs::canonicalize(dest).await,
            tokio::fs::canonicalize(blob).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        // Hard links share content; without inode access, matching length is
        // the available cheap signal. Content is still covered by validation.
        let (Ok(dest_meta), Ok(blob_meta)) = (
            tokio::fs::metadata(dest).await,
            tokio::fs::metadata(blob).await,
        ) else {
            return false;
        };
        dest_meta.is_file() && dest_meta.len() == blob_meta.len()
    }
}

async fn remove_existing(dest: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(dest).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(dest)
            .await
            .map_err(EngineError::fs),
        Ok(_) => tokio::fs::remove_file(dest).await.map_err(EngineError::fs),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::fs(err)),
    }
}

/// Create the platform-appropriate link from a version entry to a blob:
/// relative symlinks survive directory moves on unix; hard links avoid the
/// symlink privilege requirement on Windows.
async fn place_link(dest: &Path, blob: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let parent = dest.parent().unwrap_or_else(|| Path::new(""));
        let target = relative_path(parent, blob);
        tokio::fs::symlink(&target, dest)
            .await
            .map_err(EngineError::fs)
    }
    #[cfg(not(unix))]
    {
        tokio::fs::hard_link(blob, dest)
            .await
            .map_err(EngineError::fs)
    }
}

/// Relative path from `from_dir` to `to`; both must be absolute.
#[cfg_attr(not(unix), allow(dead_code))]
fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from_dir.components().collect();
    let to_components: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(&to_components)
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to_components[common..] {
        relative.push(component);
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::FileHash;
    use crate::manifest::{BundleFile, PlatformArchive, SCHEMA_VERSION};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manifest_with(build: u64, files: Vec<BundleFile>) -> BundleManifest {
        BundleManifest {
            schema_version: SCHEMA_VERSION,
            build_number: build,
            created_at: "2026-01-15T10:00:00Z".into(),
            min_shell_version: 1,
            shell_update_url: None,
            files,
            main_class: "main".into(),
            zips: BTreeMap::from([(
                Platform::detect().unwrap(),
                PlatformArchive {
                    zip_path: "bundle.zip".into(),
                    size: 0,
                },
            )]),
            signature: "ed25519:AA==".into(),
        }
    }

    async fn seeded(content: &[u8]) -> (tempfile::TempDir, StorageManager, ContentStore, FileHash) {
        let dir = tempdir().unwrap();
        let storage = StorageManager::open(dir.path().join("bundle")).unwrap();
        let cas = ContentStore::open(storage.cas_dir()).unwrap();
        let temp = storage.new_temp_path().unwrap();
        tokio::fs::write(&temp, content).await.unwrap();
        let hash = FileHash::of_bytes(content);
        cas.insert_from(temp, &hash).await.unwrap();
        (dir, storage, cas, hash)
    }

    #[tokio::test]
    async fn prepare_version_links_into_the_store() {
        let (_dir, storage, cas, hash) = seeded(b"app contents").await;
        let manifest = manifest_with(
            7,
            vec![BundleFile {
                path: "lib/app.jar".into(),
                hash,
                size: 12,
                os: None,
                arch: None,
            }],
        );

        let scope = storage.write_scope().await.unwrap();
        let version_dir = scope
            .prepare_version(&manifest, Platform::detect().unwrap(), &cas)
            .await
            .unwrap();

        let linked = version_dir.join("lib/app.jar");
        assert_eq!(tokio::fs::read(&linked).await.unwrap(), b"app contents");
        #[cfg(unix)]
        assert!(tokio::fs::symlink_metadata(&linked)
            .await
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[tokio::test]
    async fn prepare_version_repairs_a_stale_entry() {
        let (_dir, storage, cas, hash) = seeded(b"good bytes").await;
        let manifest = manifest_with(
            3,
            vec![BundleFile {
                path: "app.bin".into(),
                hash,
                size: 10,
                os: None,
                arch: None,
            }],
        );
        let stale = storage.version_dir(3).join("app.bin");
        tokio::fs::create_dir_all(stale.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&stale, b"junk").await.unwrap();

        let scope = storage.write_scope().await.unwrap();
        scope
            .prepare_version(&manifest, Platform::detect().unwrap(), &cas)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&stale).await.unwrap(), b"good bytes");
    }

    #[tokio::test]
    async fn prepare_version_fails_loudly_on_a_missing_blob() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::open(dir.path().join("bundle")).unwrap();
        let cas = ContentStore::open(storage.cas_dir()).unwrap();
        let manifest = manifest_with(
            1,
            vec![BundleFile {
                path: "app.bin".into(),
                hash: FileHash::of_bytes(b"nowhere"),
                size: 7,
                os: None,
                arch: None,
            }],
        );

        let scope = storage.write_scope().await.unwrap();
        let err = scope
            .prepare_version(&manifest, Platform::detect().unwrap(), &cas)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingFromStore(_)));
    }

    #[tokio::test]
    async fn manifest_save_round_trips_raw_bytes() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::open(dir.path().join("bundle")).unwrap();
        assert!(storage.read_manifest().await.unwrap().is_none());

        // Raw bytes with an unknown field; saving must preserve them.
        let raw = br#"{"schemaVersion":1,"buildNumber":5,"createdAt":"t","minShellVersion":1,"shellUpdateUrl":null,"files":[],"mainClass":"m","zips":{"linux-x64":{"zip":"a.zip","size":1}},"signature":"ed25519:AA==","extra":42}"#;
        let scope = storage.write_scope().await.unwrap();
        scope.save_manifest(raw).await.unwrap();
        drop(scope);

        let document = storage.read_manifest().await.unwrap().unwrap();
        assert_eq!(document.raw(), raw.as_slice());
        assert_eq!(document.manifest().build_number, 5);
    }

    #[tokio::test]
    async fn write_scope_is_exclusive_within_the_process() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::open(dir.path().join("bundle")).unwrap();

        let first = storage.write_scope().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(100), storage.write_scope()).await;
        assert!(second.is_err(), "second scope acquired while first held");
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(500), storage.write_scope()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn cleanup_temp_purges_everything() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::open(dir.path().join("bundle")).unwrap();
        tokio::fs::write(storage.temp_dir().join("a"), b"x")
            .await
            .unwrap();
        tokio::fs::create_dir(storage.temp_dir().join("nested"))
            .await
            .unwrap();
        tokio::fs::write(storage.temp_dir().join("nested/b"), b"y")
            .await
            .unwrap();

        let scope = storage.write_scope().await.unwrap();
        assert_eq!(scope.cleanup_temp().await.unwrap(), 2);
        drop(scope);
        let mut entries = std::fs::read_dir(storage.temp_dir()).unwrap();
        assert!(entries.next().is_none());
    }

    #[test]
    fn relative_path_walks_up_and_down() {
        assert_eq!(
            relative_path(
                Path::new("/data/bundle/versions/7/lib"),
                Path::new("/data/bundle/cas/abcd")
            ),
            PathBuf::from("../../../cas/abcd")
        );
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/b/c")),
            PathBuf::from("c")
        );
    }
}
