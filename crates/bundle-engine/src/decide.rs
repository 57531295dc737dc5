//! Choice between the full-archive and per-file download strategies.

use crate::cas::ContentStore;
use crate::manifest::{BundleFile, BundleManifest};
use crate::platform::Platform;

/// Fixed model of the per-request cost of an incremental fetch, in bytes.
/// Keeps the decision reproducible across implementations.
pub const PER_REQUEST_OVERHEAD: u64 = 50_000;

/// The plan for bringing the store up to a manifest's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPlan {
    /// Every applicable blob is already present.
    NoDownloadNeeded,
    /// Fetch the platform ZIP in one request.
    FullArchive { total_size: u64, file_count: usize },
    /// Fetch exactly the missing blobs.
    Incremental {
        files: Vec<BundleFile>,
        total_data_size: u64,
    },
}

/// Inspect the store and choose a strategy for the target platform.
///
/// Ties go to the full archive: one request eliminates tail-latency
/// variance across many small fetches.
pub fn plan_download(
    manifest: &BundleManifest,
    platform: Platform,
    cas: &ContentStore,
) -> DownloadPlan {
    let applicable: Vec<&BundleFile> = manifest.files_for_platform(platform).collect();
    let missing: Vec<BundleFile> = applicable
        .iter()
        .filter(|file| !cas.contains(&file.hash))
        .map(|file| (*file).clone())
        .collect();
    if missing.is_empty() {
        return DownloadPlan::NoDownloadNeeded;
    }

    let full_size = manifest
        .archive_for(platform)
        .map(|archive| archive.size)
        .unwrap_or_else(|| applicable.iter().map(|file| file.size).sum());
    let total_data_size: u64 = missing.iter().map(|file| file.size).sum();
    let effective_incremental =
        total_data_size + missing.len() as u64 * PER_REQUEST_OVERHEAD;

    if full_size <= effective_incremental {
        DownloadPlan::FullArchive {
            total_size: full_size,
            file_count: applicable.len(),
        }
    } else {
        DownloadPlan::Incremental {
            files: missing,
            total_data_size,
        }
    }
}
