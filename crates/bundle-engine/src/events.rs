//! Engine progress and state events.

use crate::cleanup::CleanupStats;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Byte- and file-level progress for a download or verification pass.
///
/// `total_bytes` is the sum of the sizes of the applicable files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub files_done: u64,
    pub total_files: u64,
}

/// Events the engine emits, in causal order, while driving an update cycle.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The installed bundle is being validated.
    Validating,
    /// Verification progress while rehashing the installed files.
    Verifying(TransferProgress),
    /// The download strategy is being chosen against the store.
    DownloadDeciding,
    /// Bytes are moving.
    Downloading(TransferProgress),
    /// The version directory is being materialized and the manifest saved.
    Finalizing,
    /// Control is about to pass to the bundle entry point.
    Launching,
    /// The engine confirmed the installed build matches the server.
    UpToDate,
    /// The manifest demands a newer shell than the one running.
    ShellUpdateRequired {
        current: u32,
        required: u32,
        update_url: Option<String>,
    },
    /// A retryable failure; the engine sleeps before the next attempt.
    BackingOff {
        retry_number: u32,
        delay: Duration,
        next_retry: SystemTime,
        error: String,
    },
    /// Terminal failure of the current operation.
    Failed {
        reason: String,
        retryable: bool,
        cause: Option<String>,
    },
    /// A cleanup pass finished.
    CleanupComplete(CleanupStats),
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateEvent::Validating => write!(f, "validating installed bundle"),
            UpdateEvent::Verifying(p) => write!(
                f,
                "verifying {}/{} files ({}/{} bytes)",
                p.files_done, p.total_files, p.bytes_done, p.total_bytes
            ),
            UpdateEvent::DownloadDeciding => write!(f, "planning download"),
            UpdateEvent::Downloading(p) => write!(
                f,
                "downloading {}/{} files ({}/{} bytes)",
                p.files_done, p.total_files, p.bytes_done, p.total_bytes
            ),
            UpdateEvent::Finalizing => write!(f, "finalizing version"),
            UpdateEvent::Launching => write!(f, "launching bundle"),
            UpdateEvent::UpToDate => write!(f, "bundle is up to date"),
            UpdateEvent::ShellUpdateRequired {
                current, required, ..
            } => write!(f, "shell {current} is older than required {required}"),
            UpdateEvent::BackingOff {
                retry_number,
                delay,
                error,
                ..
            } => write!(f, "retry {retry_number} in {delay:?} after: {error}"),
            UpdateEvent::Failed {
                reason, retryable, ..
            } => write!(f, "failed ({reason}, retryable={retryable})"),
            UpdateEvent::CleanupComplete(stats) => write!(
                f,
                "cleanup removed {} versions, {} blobs, {} bytes",
                stats.versions_removed.len(),
                stats.cas_files_removed,
                stats.bytes_freed
            ),
        }
    }
}

/// Sending half of the engine's event stream.
///
/// Consumers must not reorder events; the unbounded channel preserves the
/// causal order the engine emits in. Emission never fails: once the
/// receiver is gone, events only reach the log.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, rx)
    }

    /// Emit one event.
    pub fn emit(&self, event: UpdateEvent) {
        tracing::debug!(event = %event, "engine event");
        let _ = self.tx.send(event);
    }
}
