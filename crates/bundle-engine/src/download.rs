//! Strategy execution: stream missing bytes into the content store.

use crate::cas::ContentStore;
use crate::decide::DownloadPlan;
use crate::error::{EngineError, Result};
use crate::events::{EventSender, TransferProgress, UpdateEvent};
use crate::fetch::{Fetcher, MAX_PARALLEL_TRANSFERS};
use crate::hash::FileHash;
use crate::manifest::{BundleFile, BundleManifest};
use crate::platform::Platform;
use crate::storage::StorageManager;
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Executes a [`DownloadPlan`], landing every fetched blob in the store
/// only after its digest checked out.
pub struct Downloader<'a> {
    fetcher: &'a dyn Fetcher,
    cas: &'a ContentStore,
    storage: &'a StorageManager,
    events: &'a EventSender,
    cancel: &'a CancellationToken,
}

impl<'a> Downloader<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        cas: &'a ContentStore,
        storage: &'a StorageManager,
        events: &'a EventSender,
        cancel: &'a CancellationToken,
    ) -> Self {
        Downloader {
            fetcher,
            cas,
            storage,
            events,
            cancel,
        }
    }

    /// Run the chosen strategy to completion.
    pub async fn execute(
        &self,
        manifest: &BundleManifest,
        platform: Platform,
        plan: &DownloadPlan,
    ) -> Result<()> {
        match plan {
            DownloadPlan::NoDownloadNeeded => Ok(()),
            DownloadPlan::FullArchive {
                total_size,
                file_count,
            } => {
                info!(build = manifest.build_number, size = total_size, "downloading full archive");
                self.download_full_archive(manifest, platform, *total_size, *file_count as u64)
                    .await
            }
            DownloadPlan::Incremental {
                files,
                total_data_size,
            } => {
                info!(
                    build = manifest.build_number,
                    files = files.len(),
                    bytes = total_data_size,
                    "downloading incrementally"
                );
                self.download_incremental(files, *total_data_size).await
            }
        }
    }

    async fn download_full_archive(
        &self,
        manifest: &BundleManifest,
        platform: Platform,
        total_size: u64,
        file_count: u64,
    ) -> Result<()> {
        let archive = manifest
            .archive_for(platform)
            .ok_or_else(|| EngineError::PlatformUnsupported(platform.to_string()))?;

        let temp = self.storage.new_temp_path()?;
        self.events.emit(UpdateEvent::Downloading(TransferProgress {
            bytes_done: 0,
            total_bytes: total_size,
            files_done: 0,
            total_files: file_count,
        }));
        self.stream_to_file(&archive.zip_path, &temp, total_size, file_count)
            .await?;

        let staged = self.unpack_archive(&temp).await;
        let _ = tokio::fs::remove_file(&temp).await;
        for (path, hash) in staged? {
            self.cas.insert_from(path, &hash).await?;
        }
        self.events.emit(UpdateEvent::Downloading(TransferProgress {
            bytes_done: total_size,
            total_bytes: total_size,
            files_done: file_count,
            total_files: file_count,
        }));
        Ok(())
    }

    /// Read archive entries (named by hex digest) into staged temp files.
    /// Entries whose blob already exists are skipped.
    async fn unpack_archive(&self, archive_path: &Path) -> Result<Vec<(PathBuf, FileHash)>> {
        let archive_path = archive_path.to_path_buf();
        let temp_dir = self.storage.temp_dir();
        let cas = self.cas.clone();
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, FileHash)>> {
            let file = std::fs::File::open(&archive_path).map_err(EngineError::fs)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|err| EngineError::validation(format!("unreadable archive: {err}")))?;
            let mut staged = Vec::new();
            for index in 0..archive.len() {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let mut entry = archive.by_index(index).map_err(|err| {
                    EngineError::validation(format!("unreadable archive entry: {err}"))
                })?;
                if entry.is_dir() {
                    continue;
                }
                let hash = FileHash::parse_hex(entry.name())?;
                if cas.contains(&hash) {
                    continue;
                }
                let temp = tempfile::Builder::new()
                    .prefix("entry-")
                    .tempfile_in(&temp_dir)
                    .map_err(EngineError::fs)?;
                let (mut out, temp_path) = temp.into_parts();
                std::io::copy(&mut entry, &mut out).map_err(EngineError::fs)?;
                drop(out);
                let path = temp_path.keep().map_err(|err| EngineError::fs(err.error))?;
                staged.push((path, hash));
            }
            Ok(staged)
        })
        .await
        .map_err(|err| EngineError::Other(format!("archive task failed: {err}")))?
    }

    async fn download_incremental(&self, files: &[BundleFile], total_bytes: u64) -> Result<()> {
        let total_files = files.len() as u64;
        let bytes_done = AtomicU64::new(0);
        let files_done = AtomicU64::new(0);
        futures::stream::iter(files.iter().map(|file| {
            self.fetch_blob(file, total_bytes, total_files, &bytes_done, &files_done)
        }))
        .buffer_unordered(MAX_PARALLEL_TRANSFERS)
        .try_collect::<Vec<()>>()
        .await?;
        Ok(())
    }

    async fn fetch_blob(
        &self,
        file: &BundleFile,
        total_bytes: u64,
        total_files: u64,
        bytes_done: &AtomicU64,
        files_done: &AtomicU64,
    ) -> Result<()> {
        debug!(path = %file.path, hash = %file.hash, "fetching blob");
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let temp = self.storage.new_temp_path()?;
        let resource = format!("files/{}", file.hash.to_hex());
        let mut response = self.fetcher.fetch(&resource).await?;
        let mut out = tokio::fs::File::create(&temp)
            .await
            .map_err(EngineError::fs)?;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                chunk = response.stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            out.write_all(&chunk).await.map_err(EngineError::fs)?;
            let done = bytes_done.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                + chunk.len() as u64;
            self.events.emit(UpdateEvent::Downloading(TransferProgress {
                bytes_done: done,
                total_bytes,
                files_done: files_done.load(Ordering::Relaxed),
                total_files,
            }));
        }
        out.flush().await.map_err(EngineError::fs)?;
        drop(out);

        self.cas.insert_from(temp, &file.hash).await?;
        let done = files_done.fetch_add(1, Ordering::Relaxed) + 1;
        self.events.emit(UpdateEvent::Downloading(TransferProgress {
            bytes_done: bytes_done.load(Ordering::Relaxed),
            total_bytes,
            files_done: done,
            total_files,
        }));
        Ok(())
    }

    /// Stream one resource into a file, reporting archive-level progress.
    async fn stream_to_file(
        &self,
        resource: &str,
        dest: &Path,
        total_bytes: u64,
        total_files: u64,
    ) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut response = self.fetcher.fetch(resource).await?;
        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(EngineError::fs)?;
        let mut done = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                chunk = response.stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            out.write_all(&chunk).await.map_err(EngineError::fs)?;
            done += chunk.len() as u64;
            self.events.emit(UpdateEvent::Downloading(TransferProgress {
                bytes_done: done,
                total_bytes: total_bytes.max(done),
                files_done: 0,
                total_files,
            }));
        }
        out.flush().await.map_err(EngineError::fs)?;
        Ok(done)
    }
}
