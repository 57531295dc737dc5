//! Update orchestration: check, download, finalize, clean up, launch.

use crate::cas::ContentStore;
use crate::cleanup::CleanupManager;
use crate::config::EngineConfig;
use crate::decide;
use crate::download::Downloader;
use crate::error::{EngineError, Result};
use crate::events::{EventSender, UpdateEvent};
use crate::fetch::Fetcher;
use crate::launch::{BundleLauncher, LaunchConfig, LaunchRequest};
use crate::manifest::ManifestDocument;
use crate::signing;
use crate::storage::StorageManager;
use crate::validate::{FileFailure, ValidationResult, Validator};
use std::future::Future;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one `download_latest` cycle.
#[derive(Debug)]
pub enum DownloadResult {
    /// A newer build was downloaded and finalized.
    Success,
    /// The server offers nothing newer than the installed build; storage
    /// was not touched.
    AlreadyUpToDate,
    /// The cycle failed; retryability is carried by the error.
    Failed(EngineError),
    /// The cancel signal stopped the cycle.
    Cancelled,
}

/// Terminal outcome of the startup flow.
#[derive(Debug, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The bundle ran and exited with this code.
    Exited(i32),
    /// The shell is too old for the available bundle.
    ShellUpdateRequired,
    /// A terminal failure was emitted on the event stream.
    Failed,
}

/// Drives the full update cycle against one bundle directory.
pub struct UpdateEngine<F> {
    config: EngineConfig,
    fetcher: F,
    storage: StorageManager,
    cas: ContentStore,
    events: EventSender,
    cancel: CancellationToken,
}

impl<F> UpdateEngine<F>
where
    F: Fetcher,
{
    /// Open the engine's storage and return it with the event stream.
    pub fn new(
        config: EngineConfig,
        fetcher: F,
    ) -> Result<(Self, UnboundedReceiver<UpdateEvent>)> {
        let storage = StorageManager::open(config.bundle_dir())?;
        let cas = ContentStore::open(storage.cas_dir())?;
        let (events, receiver) = EventSender::channel();
        Ok((
            UpdateEngine {
                config,
                fetcher,
                storage,
                cas,
                events,
                cancel: CancellationToken::new(),
            },
            receiver,
        ))
    }

    /// Token external callers may use to cancel in-flight work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all in-flight and future work. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Validate the installed bundle.
    pub async fn validate(&self) -> ValidationResult {
        self.events.emit(UpdateEvent::Validating);
        Validator::new(
            &self.storage,
            &self.cas,
            &self.config.public_key,
            self.config.platform,
            self.config.shell_version,
            &self.events,
            &self.cancel,
        )
        .validate()
        .await
    }

    /// Fetch the server manifest and install it if strictly newer than the
    /// installed build. This is the only monotonicity rule: a build number
    /// not greater than the current one never touches storage.
    pub async fn download_latest(&self) -> DownloadResult {
        let current = self.current_build_number().await;
        self.download_newer_than(current).await
    }

    /// One background cycle: check, download, and clean up when up to date.
    pub async fn check_and_download(&self) -> DownloadResult {
        let result = self.download_latest().await;
        match &result {
            DownloadResult::Success => {
                self.run_cleanup().await;
            }
            DownloadResult::AlreadyUpToDate => {
                self.events.emit(UpdateEvent::UpToDate);
                self.run_cleanup().await;
            }
            DownloadResult::Failed(err) => {
                self.events.emit(UpdateEvent::Failed {
                    reason: err.to_string(),
                    retryable: err.is_retryable(),
                    cause: None,
                });
            }
            DownloadResult::Cancelled => {
                self.events.emit(UpdateEvent::Failed {
                    reason: "cancelled".into(),
                    retryable: false,
                    cause: None,
                });
            }
        }
        result
    }

    /// Check for updates forever, pausing `checkInterval` between cycles.
    pub async fn run_in_background(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.check_and_download().await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
    }

    /// The startup flow: validate, launch, and fall back to downloading
    /// when nothing launchable is installed.
    pub async fn validate_and_launch(&self, launcher: &dyn BundleLauncher) -> LaunchOutcome {
        match self.validate().await {
            ValidationResult::Valid {
                manifest,
                version_path,
            } => self.launch(launcher, &manifest, version_path).await,
            ValidationResult::NoBundle => self.download_and_launch(launcher, &[]).await,
            ValidationResult::Failed { reason, failures } => {
                info!(reason, "installed bundle unusable, downloading");
                self.download_and_launch(launcher, &failures).await
            }
            ValidationResult::ShellUpdateRequired {
                current,
                required,
                update_url,
            } => {
                self.events.emit(UpdateEvent::ShellUpdateRequired {
                    current,
                    required,
                    update_url,
                });
                LaunchOutcome::ShellUpdateRequired
            }
            ValidationResult::NetworkError(message) => {
                self.events.emit(UpdateEvent::Failed {
                    reason: message,
                    retryable: true,
                    cause: None,
                });
                LaunchOutcome::Failed
            }
        }
    }

    async fn current_build_number(&self) -> u64 {
        match self.storage.read_manifest().await {
            Ok(Some(document)) => document.manifest().build_number,
            _ => 0,
        }
    }

    async fn download_newer_than(&self, current: u64) -> DownloadResult {
        match self.try_download(current).await {
            Ok(Some(_)) => DownloadResult::Success,
            Ok(None) => DownloadResult::AlreadyUpToDate,
            Err(EngineError::Cancelled) => DownloadResult::Cancelled,
            Err(err) => DownloadResult::Failed(err),
        }
    }

    async fn try_download(&self, current: u64) -> Result<Option<ManifestDocument>> {
        let document = self
            .with_retries(|| self.fetch_manifest_document())
            .await?;
        let manifest = document.manifest();
        if !manifest.supports(self.config.platform) {
            return Err(EngineError::PlatformUnsupported(
                self.config.platform.to_string(),
            ));
        }
        if manifest.build_number <= current {
            info!(
                server = manifest.build_number,
                current, "no newer build available"
            );
            return Ok(None);
        }
        self.with_retries(|| self.install(&document)).await?;
        Ok(Some(document))
    }

    async fn fetch_manifest_document(&self) -> Result<ManifestDocument> {
        let raw = self.fetcher.fetch_bytes("manifest.json").await?;
        let document = ManifestDocument::parse(raw)?;
        document.verify(&self.config.public_key)?;
        Ok(document)
    }

    /// Plan, download, and finalize one manifest. Safe to re-run: the
    /// planner resumes from whatever already landed in the store.
    async fn install(&self, document: &ManifestDocument) -> Result<()> {
        let manifest = document.manifest();
        self.events.emit(UpdateEvent::DownloadDeciding);
        let plan = decide::plan_download(manifest, self.config.platform, &self.cas);
        Downloader::new(
            &self.fetcher,
            &self.cas,
            &self.storage,
            &self.events,
            &self.cancel,
        )
        .execute(manifest, self.config.platform, &plan)
        .await?;

        self.events.emit(UpdateEvent::Finalizing);
        let scope = self.storage.write_scope().await?;
        scope
            .prepare_version(manifest, self.config.platform, &self.cas)
            .await?;
        scope.save_manifest(document.raw()).await?;
        info!(build = manifest.build_number, "version finalized");
        Ok(())
    }

    /// The re-download half of the startup flow. `failures` are the file
    /// verification records from the failed validation, whose blobs must
    /// not be trusted again.
    async fn download_and_launch(
        &self,
        launcher: &dyn BundleLauncher,
        failures: &[FileFailure],
    ) -> LaunchOutcome {
        // A corrupt blob still sits under its digest name, so the planner
        // would skip it. Drop the recorded failures first.
        for failure in failures {
            self.cas.delete(&failure.expected).await;
        }

        // The installed bundle is unusable here, so same-build repair is a
        // re-install, not a downgrade.
        match self.download_newer_than(0).await {
            DownloadResult::Success => match self.validate().await {
                ValidationResult::Valid {
                    manifest,
                    version_path,
                } => self.launch(launcher, &manifest, version_path).await,
                other => {
                    warn!(result = ?other, "freshly downloaded bundle failed validation");
                    self.events.emit(UpdateEvent::Failed {
                        reason: "downloaded bundle failed validation".into(),
                        retryable: false,
                        cause: None,
                    });
                    LaunchOutcome::Failed
                }
            },
            DownloadResult::AlreadyUpToDate => {
                self.events.emit(UpdateEvent::Failed {
                    reason: "validation failed and no update available".into(),
                    retryable: false,
                    cause: None,
                });
                LaunchOutcome::Failed
            }
            DownloadResult::Failed(err) => {
                self.events.emit(UpdateEvent::Failed {
                    reason: err.to_string(),
                    retryable: err.is_retryable(),
                    cause: None,
                });
                LaunchOutcome::Failed
            }
            DownloadResult::Cancelled => {
                self.events.emit(UpdateEvent::Failed {
                    reason: "cancelled".into(),
                    retryable: false,
                    cause: None,
                });
                LaunchOutcome::Failed
            }
        }
    }

    async fn launch(
        &self,
        launcher: &dyn BundleLauncher,
        document: &ManifestDocument,
        version_path: PathBuf,
    ) -> LaunchOutcome {
        self.events.emit(UpdateEvent::Launching);
        let manifest = document.manifest();
        let request = LaunchRequest {
            version_path,
            main_class: manifest.main_class.clone(),
            config: LaunchConfig {
                app_data_dir: self.config.app_data_dir.clone(),
                bundle_subdirectory: self.config.bundle_subdirectory.clone(),
                base_url: self.config.base_url.to_string(),
                public_key: signing::encode_public_key(&self.config.public_key),
                platform: self.config.platform.to_string(),
                shell_version: self.config.shell_version,
                current_build_number: manifest.build_number,
            },
        };
        match launcher.launch(request).await {
            Ok(code) => LaunchOutcome::Exited(code),
            Err(err) => {
                self.events.emit(UpdateEvent::Failed {
                    reason: format!("launch failed: {err}"),
                    retryable: false,
                    cause: None,
                });
                LaunchOutcome::Failed
            }
        }
    }

    /// Cleanup runs only right after the engine confirmed up-to-date
    /// status. Its failures are logged, never surfaced.
    async fn run_cleanup(&self) {
        let Ok(Some(document)) = self.storage.read_manifest().await else {
            return;
        };
        match CleanupManager::new(&self.storage, &self.cas)
            .run(document.manifest(), self.config.platform)
            .await
        {
            Ok(stats) => self.events.emit(UpdateEvent::CleanupComplete(stats)),
            Err(err) => warn!(error = %err, "cleanup failed"),
        }
    }

    /// Absorb retryable errors with exponential backoff; anything else
    /// terminates immediately.
    async fn with_retries<T, Fut, Op>(&self, mut op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retry < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay_for(retry);
                    retry += 1;
                    warn!(retry, ?delay, error = %err, "backing off");
                    self.events.emit(UpdateEvent::BackingOff {
                        retry_number: retry,
                        delay,
                        next_retry: SystemTime::now() + delay,
                        error: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::fetch::{ByteStream, FetchResponse};
    use crate::platform::Platform;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ed25519_dalek::SigningKey;
    use reqwest::Url;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Serves a scripted sequence of responses for `manifest.json`.
    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<Bytes>>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<Bytes>>) -> Self {
            ScriptedFetcher {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _path: &str) -> Result<FetchResponse> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Network("script exhausted".into())));
            let bytes = next?;
            let content_length = Some(bytes.len() as u64);
            let stream: ByteStream = Box::pin(futures::stream::iter([Ok(bytes)]));
            Ok(FetchResponse {
                stream,
                content_length,
            })
        }
    }

    fn engine_with(
        responses: Vec<Result<Bytes>>,
    ) -> (
        tempfile::TempDir,
        UpdateEngine<ScriptedFetcher>,
        UnboundedReceiver<UpdateEvent>,
    ) {
        let dir = tempdir().unwrap();
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let config = EngineConfig::new(
            dir.path().join("app"),
            Url::parse("https://example.com/updates/").unwrap(),
            key.verifying_key(),
            1,
            Platform::detect().unwrap(),
        )
        .retry(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: 2,
        });
        let (engine, events) = UpdateEngine::new(config, ScriptedFetcher::new(responses)).unwrap();
        (dir, engine, events)
    }

    fn drain(events: &mut UnboundedReceiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn transient_manifest_failures_back_off_then_fail() {
        let (_dir, engine, mut events) = engine_with(vec![
            Err(EngineError::Network("reset".into())),
            Err(EngineError::HttpRetryable(503, "manifest.json".into())),
            Err(EngineError::Network("reset again".into())),
        ]);

        let result = engine.download_latest().await;
        assert!(matches!(result, DownloadResult::Failed(err) if err.is_retryable()));

        let backoffs: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                UpdateEvent::BackingOff {
                    retry_number,
                    delay,
                    ..
                } => Some((retry_number, delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            backoffs,
            vec![
                (1, Duration::from_millis(1)),
                (2, Duration::from_millis(2))
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_failures_skip_backoff() {
        let (_dir, engine, mut events) = engine_with(vec![
            Err(EngineError::HttpRejected(404, "manifest.json".into())),
            Ok(Bytes::from_static(b"never fetched")),
        ]);

        let result = engine.download_latest().await;
        assert!(matches!(result, DownloadResult::Failed(err) if !err.is_retryable()));
        assert!(drain(&mut events)
            .iter()
            .all(|event| !matches!(event, UpdateEvent::BackingOff { .. })));
    }

    #[tokio::test]
    async fn unparseable_manifest_is_terminal() {
        let (_dir, engine, _events) =
            engine_with(vec![Ok(Bytes::from_static(b"{ not json"))]);
        let result = engine.download_latest().await;
        assert!(matches!(
            result,
            DownloadResult::Failed(EngineError::ManifestDecode(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_engine_reports_cancellation() {
        let (_dir, engine, _events) = engine_with(vec![Ok(Bytes::from_static(b"{}"))]);
        engine.close();
        assert!(matches!(
            engine.download_latest().await,
            DownloadResult::Cancelled
        ));
    }

    #[tokio::test]
    async fn background_loop_stops_once_closed() {
        let (_dir, engine, _events) = engine_with(vec![]);
        engine.close();
        tokio::time::timeout(Duration::from_secs(1), engine.run_in_background())
            .await
            .expect("closed engine must leave the background loop");
    }
}
