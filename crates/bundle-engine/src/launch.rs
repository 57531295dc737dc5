//! Hand-off to the bundle entry point.
//!
//! The loader is an external collaborator: the engine only supplies the
//! materialized version directory, the entry name from the manifest, and a
//! launch-configuration JSON blob. [`ProcessLauncher`] is the sub-process
//! rendition of that contract.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::info;

/// The configuration blob forwarded to the bundle as its single positional
/// argument, serialized as camelCase JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    pub app_data_dir: PathBuf,
    pub bundle_subdirectory: String,
    pub base_url: String,
    pub public_key: String,
    pub platform: String,
    pub shell_version: u32,
    pub current_build_number: u64,
}

/// Everything a loader needs to start one validated bundle.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// The materialized `versions/<buildNumber>/` directory.
    pub version_path: PathBuf,
    /// Opaque entry-point name from the manifest.
    pub main_class: String,
    pub config: LaunchConfig,
}

/// The entry-point loader seam.
#[async_trait]
pub trait BundleLauncher: Send + Sync {
    /// Start the bundle and block until it exits, returning its exit code.
    async fn launch(&self, request: LaunchRequest) -> Result<i32>;
}

type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Single-writer, single-reader slot holding the exit notification.
#[derive(Default)]
pub struct ExitNotifier {
    callback: Mutex<Option<ExitCallback>>,
}

impl ExitNotifier {
    /// Install the callback; replaces any previous one.
    pub fn set(&self, callback: impl FnOnce(i32) + Send + 'static) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Fire the callback, at most once.
    pub fn notify(&self, code: i32) {
        let callback = self.callback.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback(code);
        }
    }
}

/// Launcher that executes `versions/<build>/<mainClass>` as a child process.
///
/// An optional message channel is forwarded line-by-line to the child's
/// stdin; the exit status is reported through the notifier exactly once.
#[derive(Default)]
pub struct ProcessLauncher {
    messages: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    exit: ExitNotifier,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the shell-to-bundle message channel.
    pub fn set_messages(&self, receiver: mpsc::UnboundedReceiver<String>) {
        if let Ok(mut slot) = self.messages.lock() {
            *slot = Some(receiver);
        }
    }

    /// Install the exit callback.
    pub fn on_exit(&self, callback: impl FnOnce(i32) + Send + 'static) {
        self.exit.set(callback);
    }
}

#[async_trait]
impl BundleLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<i32> {
        let program = request.version_path.join(&request.main_class);
        let argument = serde_json::to_string(&request.config)
            .map_err(|err| EngineError::Other(format!("launch config serialization: {err}")))?;

        info!(program = %program.display(), "launching bundle entry point");
        let mut command = tokio::process::Command::new(&program);
        command.arg(argument).current_dir(&request.version_path);

        let messages = self.messages.lock().ok().and_then(|mut slot| slot.take());
        if messages.is_some() {
            command.stdin(Stdio::piped());
        }
        let mut child = command.spawn().map_err(EngineError::fs)?;

        if let Some(mut receiver) = messages {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    while let Some(message) = receiver.recv().await {
                        if stdin.write_all(message.as_bytes()).await.is_err()
                            || stdin.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
        }

        let status = child.wait().await.map_err(EngineError::fs)?;
        let code = status.code().unwrap_or(-1);
        self.exit.notify(code);
        Ok(code)
    }
}
