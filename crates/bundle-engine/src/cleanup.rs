//! Removal of non-current versions and unreferenced store blobs.

use crate::cas::ContentStore;
use crate::error::Result;
use crate::manifest::BundleManifest;
use crate::platform::Platform;
use crate::storage::StorageManager;
use std::collections::HashSet;
use tracing::{info, warn};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub versions_removed: Vec<u64>,
    pub cas_files_removed: u64,
    pub bytes_freed: u64,
}

/// Deletes state no longer reachable from the current manifest.
///
/// Callers may invoke this only after confirming the installed build matches
/// the server; while the engine is not up to date nothing is ever deleted,
/// so an interrupted download can always resume from whatever existed.
pub struct CleanupManager<'a> {
    storage: &'a StorageManager,
    cas: &'a ContentStore,
}

impl<'a> CleanupManager<'a> {
    pub fn new(storage: &'a StorageManager, cas: &'a ContentStore) -> Self {
        CleanupManager { storage, cas }
    }

    /// Purge temp files, stale version directories, and unreferenced blobs.
    ///
    /// Individual deletion failures are logged and skipped; they never abort
    /// the pass.
    pub async fn run(&self, manifest: &BundleManifest, platform: Platform) -> Result<CleanupStats> {
        let scope = self.storage.write_scope().await?;
        let mut stats = CleanupStats::default();

        if let Err(err) = scope.cleanup_temp().await {
            warn!(error = %err, "temp purge failed");
        }

        let current = manifest.build_number;
        match std::fs::read_dir(self.storage.versions_dir()) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let Some(build) = entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.parse::<u64>().ok())
                    else {
                        continue;
                    };
                    if build == current {
                        continue;
                    }
                    match scope.delete_version(build).await {
                        Ok(()) => stats.versions_removed.push(build),
                        Err(err) => {
                            warn!(build, error = %err, "failed to delete stale version")
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to enumerate versions"),
        }

        let referenced: HashSet<_> = manifest
            .files_for_platform(platform)
            .map(|file| file.hash)
            .collect();
        for hash in self.cas.list_hashes()? {
            if referenced.contains(&hash) {
                continue;
            }
            let size = std::fs::metadata(self.cas.blob_path(&hash))
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if self.cas.delete(&hash).await {
                stats.cas_files_removed += 1;
                stats.bytes_freed += size;
            } else {
                warn!(blob = %hash, "failed to delete unreferenced blob");
            }
        }

        stats.versions_removed.sort_unstable();
        info!(
            versions = stats.versions_removed.len(),
            blobs = stats.cas_files_removed,
            bytes = stats.bytes_freed,
            "cleanup complete"
        );
        Ok(stats)
    }
}
