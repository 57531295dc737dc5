//! Validation and repair of the installed bundle.

use crate::cas::ContentStore;
use crate::error::EngineError;
use crate::events::{EventSender, TransferProgress, UpdateEvent};
use crate::fetch::MAX_PARALLEL_TRANSFERS;
use crate::hash::FileHash;
use crate::manifest::ManifestDocument;
use crate::platform::Platform;
use crate::storage::{link_is_current, StorageManager};
use ed25519_dalek::VerifyingKey;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of validating the on-disk bundle.
#[derive(Debug)]
pub enum ValidationResult {
    /// The bundle is complete and launchable.
    Valid {
        manifest: ManifestDocument,
        version_path: PathBuf,
    },
    /// Nothing usable is installed; the engine should download.
    NoBundle,
    /// The manifest requires a newer shell.
    ShellUpdateRequired {
        current: u32,
        required: u32,
        update_url: Option<String>,
    },
    /// The bundle is present but unusable.
    Failed {
        reason: String,
        failures: Vec<FileFailure>,
    },
    /// A transient I/O failure prevented validation.
    NetworkError(String),
}

/// One file that failed verification.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: String,
    pub expected: FileHash,
    pub actual: Option<FileHash>,
    pub reason: String,
}

enum FileCheck {
    Ok { link_ok: bool },
    Bad(FileFailure),
}

/// Validates the installed bundle and repairs version links on demand.
pub struct Validator<'a> {
    storage: &'a StorageManager,
    cas: &'a ContentStore,
    public_key: &'a VerifyingKey,
    platform: Platform,
    shell_version: u32,
    events: &'a EventSender,
    cancel: &'a CancellationToken,
}

impl<'a> Validator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: &'a StorageManager,
        cas: &'a ContentStore,
        public_key: &'a VerifyingKey,
        platform: Platform,
        shell_version: u32,
        events: &'a EventSender,
        cancel: &'a CancellationToken,
    ) -> Self {
        Validator {
            storage,
            cas,
            public_key,
            platform,
            shell_version,
            events,
            cancel,
        }
    }

    /// Validate the installed bundle, repairing links where the store still
    /// has the right content.
    pub async fn validate(&self) -> ValidationResult {
        let document = match self.storage.read_manifest().await {
            Ok(Some(document)) => document,
            Ok(None) => return ValidationResult::NoBundle,
            Err(EngineError::Network(message)) => return ValidationResult::NetworkError(message),
            Err(err) => {
                warn!(error = %err, "installed manifest failed to parse");
                return ValidationResult::Failed {
                    reason: "parse".into(),
                    failures: Vec::new(),
                };
            }
        };

        if let Err(err) = document.verify(self.public_key) {
            warn!(error = %err, "installed manifest failed signature verification");
            return ValidationResult::Failed {
                reason: "signature".into(),
                failures: Vec::new(),
            };
        }

        let manifest = document.manifest();
        if !manifest.supports(self.platform) {
            return ValidationResult::Failed {
                reason: "platform".into(),
                failures: Vec::new(),
            };
        }
        if self.shell_version < manifest.min_shell_version {
            return ValidationResult::ShellUpdateRequired {
                current: self.shell_version,
                required: manifest.min_shell_version,
                update_url: manifest.shell_update_url.clone(),
            };
        }

        let version_path = self.storage.version_dir(manifest.build_number);
        if tokio::fs::metadata(&version_path).await.is_err() {
            return ValidationResult::NoBundle;
        }

        let applicable: Vec<_> = manifest.files_for_platform(self.platform).cloned().collect();
        let total_files = applicable.len() as u64;
        let total_bytes: u64 = applicable.iter().map(|file| file.size).sum();
        let files_done = AtomicU64::new(0);
        let bytes_done = AtomicU64::new(0);
        let files_done = &files_done;
        let bytes_done = &bytes_done;
        let version_dir = &version_path;

        let checks: Vec<FileCheck> =
            futures::stream::iter(applicable.iter().map(|file| async move {
                if self.cancel.is_cancelled() {
                    return FileCheck::Bad(FileFailure {
                        path: file.path.clone(),
                        expected: file.hash,
                        actual: None,
                        reason: "cancelled".into(),
                    });
                }
                let check = self.check_file(version_dir, &file.path, &file.hash).await;
                let bytes = bytes_done.fetch_add(file.size, Ordering::Relaxed) + file.size;
                let files = files_done.fetch_add(1, Ordering::Relaxed) + 1;
                self.events.emit(UpdateEvent::Verifying(TransferProgress {
                    bytes_done: bytes,
                    total_bytes,
                    files_done: files,
                    total_files,
                }));
                check
            }))
            .buffer_unordered(MAX_PARALLEL_TRANSFERS)
            .collect()
            .await;

        let mut failures = Vec::new();
        let mut needs_repair = false;
        for check in checks {
            match check {
                FileCheck::Ok { link_ok: true } => {}
                FileCheck::Ok { link_ok: false } => needs_repair = true,
                FileCheck::Bad(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            return ValidationResult::Failed {
                reason: "file verification".into(),
                failures,
            };
        }

        if needs_repair {
            info!(build = manifest.build_number, "repairing version links");
            let repair = async {
                let scope = self.storage.write_scope().await?;
                scope
                    .prepare_version(manifest, self.platform, self.cas)
                    .await
            };
            if let Err(err) = repair.await {
                warn!(error = %err, "link repair failed");
                return ValidationResult::Failed {
                    reason: "fs".into(),
                    failures: Vec::new(),
                };
            }
        }

        ValidationResult::Valid {
            version_path,
            manifest: document,
        }
    }

    /// Verify one file: the blob must exist and rehash to the declared
    /// digest; the version link is only noted, repair happens afterwards
    /// under a single write scope.
    async fn check_file(
        &self,
        version_path: &std::path::Path,
        path: &str,
        expected: &FileHash,
    ) -> FileCheck {
        let Some(blob) = self.cas.path_of(expected) else {
            return FileCheck::Bad(FileFailure {
                path: path.into(),
                expected: *expected,
                actual: None,
                reason: "missing from CAS".into(),
            });
        };
        match self.cas.hash_of(&blob).await {
            Ok(actual) if actual == *expected => {}
            Ok(actual) => {
                return FileCheck::Bad(FileFailure {
                    path: path.into(),
                    expected: *expected,
                    actual: Some(actual),
                    reason: "CAS file corrupted".into(),
                })
            }
            Err(err) => {
                return FileCheck::Bad(FileFailure {
                    path: path.into(),
                    expected: *expected,
                    actual: None,
                    reason: format!("CAS file unreadable: {err}"),
                })
            }
        }

        let dest = version_path.join(path);
        FileCheck::Ok {
            link_ok: link_is_current(&dest, &blob).await,
        }
    }
}
