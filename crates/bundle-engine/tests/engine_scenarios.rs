//! End-to-end scenarios against a `file://` update server.

use async_trait::async_trait;
use bundle_engine::{
    BundleFile, BundleLauncher, BundleManifest, DownloadResult, EngineConfig, EngineError,
    FileHash, HttpFetcher, LaunchOutcome, LaunchRequest, Platform, PlatformArchive,
    RetryPolicy, UpdateEngine, UpdateEvent, ValidationResult, SCHEMA_VERSION,
};
use ed25519_dalek::{Signer, SigningKey};
use reqwest::Url;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct TestServer {
    dir: tempfile::TempDir,
    key: SigningKey,
    platform: Platform,
}

impl TestServer {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("files")).unwrap();
        TestServer {
            dir,
            key: SigningKey::from_bytes(&[21u8; 32]),
            platform: Platform::detect().unwrap(),
        }
    }

    fn base_url(&self) -> Url {
        Url::from_directory_path(self.dir.path()).unwrap()
    }

    fn publish_blob(&self, content: &[u8]) -> FileHash {
        let hash = FileHash::of_bytes(content);
        std::fs::write(self.dir.path().join("files").join(hash.to_hex()), content).unwrap();
        hash
    }

    /// Write a real ZIP whose entries are named by digest; returns its size.
    fn publish_archive(&self, name: &str, blobs: &[&[u8]]) -> u64 {
        let file = std::fs::File::create(self.dir.path().join(name)).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for content in blobs {
            writer
                .start_file(
                    FileHash::of_bytes(content).to_hex(),
                    zip::write::FileOptions::default(),
                )
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        std::fs::metadata(self.dir.path().join(name)).unwrap().len()
    }

    /// A manifest whose declared archive is so large that the decider always
    /// picks the incremental path.
    fn manifest(&self, build: u64, files: Vec<(&str, &[u8])>) -> BundleManifest {
        self.manifest_with_archive(build, files, "bundle.zip", 10_000_000)
    }

    fn manifest_with_archive(
        &self,
        build: u64,
        files: Vec<(&str, &[u8])>,
        zip_path: &str,
        zip_size: u64,
    ) -> BundleManifest {
        BundleManifest {
            schema_version: SCHEMA_VERSION,
            build_number: build,
            created_at: "2026-02-01T08:30:00Z".into(),
            min_shell_version: 1,
            shell_update_url: Some("https://example.com/get-shell".into()),
            files: files
                .into_iter()
                .map(|(path, content)| BundleFile {
                    path: path.into(),
                    hash: FileHash::of_bytes(content),
                    size: content.len() as u64,
                    os: None,
                    arch: None,
                })
                .collect(),
            main_class: "com.example.Main".into(),
            zips: BTreeMap::from([(
                self.platform,
                PlatformArchive {
                    zip_path: zip_path.into(),
                    size: zip_size,
                },
            )]),
            signature: String::new(),
        }
    }

    fn publish_manifest(&self, manifest: &mut BundleManifest) -> Vec<u8> {
        self.publish_manifest_signed_by(manifest, &self.key)
    }

    fn publish_manifest_signed_by(
        &self,
        manifest: &mut BundleManifest,
        key: &SigningKey,
    ) -> Vec<u8> {
        let payload = bundle_engine::signing_payload(manifest).unwrap();
        manifest.signature = bundle_engine::encode_signature(&key.sign(&payload));
        let raw = bundle_engine::canonical_bytes(manifest).unwrap();
        std::fs::write(self.dir.path().join("manifest.json"), &raw).unwrap();
        raw
    }
}

struct TestShell {
    _dir: tempfile::TempDir,
    bundle_dir: PathBuf,
    engine: UpdateEngine<HttpFetcher>,
    events: UnboundedReceiver<UpdateEvent>,
}

impl TestShell {
    fn new(server: &TestServer, shell_version: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(
            dir.path().join("app"),
            server.base_url(),
            server.key.verifying_key(),
            shell_version,
            server.platform,
        )
        .bundle_subdirectory("bundle")
        .retry(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: 2,
        });
        let bundle_dir = config.bundle_dir();
        let fetcher = HttpFetcher::builder()
            .base_url(server.base_url())
            .build()
            .unwrap();
        let (engine, events) = UpdateEngine::new(config, fetcher).unwrap();
        TestShell {
            _dir: dir,
            bundle_dir,
            engine,
            events,
        }
    }

    fn drain_events(&mut self) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn manifest_path(&self) -> PathBuf {
        self.bundle_dir.join("manifest.json")
    }

    fn version_dir(&self, build: u64) -> PathBuf {
        self.bundle_dir.join("versions").join(build.to_string())
    }

    fn cas_blob(&self, hash: &FileHash) -> PathBuf {
        self.bundle_dir.join("cas").join(hash.to_hex())
    }
}

#[derive(Default)]
struct RecordingLauncher {
    requests: Mutex<Vec<LaunchRequest>>,
    exit_code: i32,
}

impl RecordingLauncher {
    fn with_exit(code: i32) -> Self {
        RecordingLauncher {
            requests: Mutex::new(Vec::new()),
            exit_code: code,
        }
    }

    fn launched(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleLauncher for RecordingLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<i32, EngineError> {
        self.requests.lock().unwrap().push(request);
        Ok(self.exit_code)
    }
}

fn position_of(events: &[UpdateEvent], predicate: impl Fn(&UpdateEvent) -> bool) -> usize {
    events
        .iter()
        .position(predicate)
        .unwrap_or_else(|| panic!("event not found in {events:?}"))
}

fn assert_file_links_to(version_file: &Path, blob: &Path, content: &[u8]) {
    assert_eq!(std::fs::read(version_file).unwrap(), content);
    assert_eq!(std::fs::read(blob).unwrap(), content);
    #[cfg(unix)]
    {
        let resolved = std::fs::canonicalize(version_file).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(blob).unwrap());
    }
}

// S1: empty bundle dir, one signed build on the server.
#[tokio::test]
async fn first_run_downloads_verifies_and_launches() {
    let server = TestServer::new();
    let content = b"app jar bytes";
    let hash = server.publish_blob(content);
    server.publish_manifest(&mut server.manifest(100, vec![("app.jar", content)]));

    let mut shell = TestShell::new(&server, 1);
    let launcher = RecordingLauncher::with_exit(0);
    let outcome = shell.engine.validate_and_launch(&launcher).await;
    assert_eq!(outcome, LaunchOutcome::Exited(0));

    let events = shell.drain_events();
    let validating = position_of(&events, |e| matches!(e, UpdateEvent::Validating));
    let downloading = position_of(&events, |e| matches!(e, UpdateEvent::Downloading(_)));
    let finalizing = position_of(&events, |e| matches!(e, UpdateEvent::Finalizing));
    let launching = position_of(&events, |e| matches!(e, UpdateEvent::Launching));
    assert!(validating < downloading && downloading < finalizing && finalizing < launching);

    assert_file_links_to(
        &shell.version_dir(100).join("app.jar"),
        &shell.cas_blob(&hash),
        content,
    );

    let requests = shell_requests(&launcher);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].main_class, "com.example.Main");
    assert_eq!(requests[0].version_path, shell.version_dir(100));
    assert_eq!(requests[0].config.current_build_number, 100);
}

fn shell_requests(launcher: &RecordingLauncher) -> Vec<LaunchRequest> {
    launcher.launched()
}

// S2: the server offers an older build than the installed one.
#[tokio::test]
async fn downgrade_attempts_leave_storage_untouched() {
    let server = TestServer::new();
    let content = b"stable payload";
    server.publish_blob(content);
    let raw_200 =
        server.publish_manifest(&mut server.manifest(200, vec![("app.jar", content)]));

    let mut shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::Success
    ));
    shell.drain_events();

    // The server rolls back to an older build.
    server.publish_manifest(&mut server.manifest(100, vec![("app.jar", content)]));
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::AlreadyUpToDate
    ));

    assert!(!shell.version_dir(100).exists());
    assert_eq!(std::fs::read(shell.manifest_path()).unwrap(), raw_200);
}

// Equal build numbers are not an update either.
#[tokio::test]
async fn equal_build_number_is_already_up_to_date() {
    let server = TestServer::new();
    let content = b"same build";
    server.publish_blob(content);
    server.publish_manifest(&mut server.manifest(7, vec![("app.jar", content)]));

    let mut shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::Success
    ));
    shell.drain_events();
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::AlreadyUpToDate
    ));
}

// S3: a manifest signed by a rotated key must leave no trace.
#[tokio::test]
async fn rotated_signing_key_is_rejected_before_any_write() {
    let server = TestServer::new();
    let content = b"untrusted payload";
    server.publish_blob(content);
    let attacker = SigningKey::from_bytes(&[99u8; 32]);
    server.publish_manifest_signed_by(
        &mut server.manifest(200, vec![("app.jar", content)]),
        &attacker,
    );

    let shell = TestShell::new(&server, 1);
    match shell.engine.download_latest().await {
        DownloadResult::Failed(EngineError::SignatureInvalid) => {}
        other => panic!("expected signature failure, got {other:?}"),
    }

    assert!(!shell.manifest_path().exists());
    let mut cas_entries = std::fs::read_dir(shell.bundle_dir.join("cas")).unwrap();
    assert!(cas_entries.next().is_none());
    assert!(!shell.version_dir(200).exists());
}

// S4: corrupted store content is re-fetched on the next launch.
#[tokio::test]
async fn cas_corruption_is_detected_and_healed() {
    let server = TestServer::new();
    let content = b"original content";
    let hash = server.publish_blob(content);
    server.publish_manifest(&mut server.manifest(42, vec![("app.jar", content)]));

    let mut shell = TestShell::new(&server, 1);
    let launcher = RecordingLauncher::with_exit(0);
    assert_eq!(
        shell.engine.validate_and_launch(&launcher).await,
        LaunchOutcome::Exited(0)
    );
    shell.drain_events();

    // Overwrite the blob behind the store's back.
    std::fs::write(shell.cas_blob(&hash), b"garbage garbage!").unwrap();
    match shell.engine.validate().await {
        ValidationResult::Failed { reason, failures } => {
            assert_eq!(reason, "file verification");
            assert_eq!(failures[0].reason, "CAS file corrupted");
        }
        other => panic!("expected failed validation, got {other:?}"),
    }

    // The startup flow repairs by re-downloading the same build.
    assert_eq!(
        shell.engine.validate_and_launch(&launcher).await,
        LaunchOutcome::Exited(0)
    );
    assert_eq!(std::fs::read(shell.cas_blob(&hash)).unwrap(), content);
    assert!(matches!(
        shell.engine.validate().await,
        ValidationResult::Valid { .. }
    ));
}

// S5: a version entry replaced by a stray file is repaired without a
// download.
#[tokio::test]
async fn broken_version_link_is_repaired_without_downloading() {
    let server = TestServer::new();
    let content = b"linked content";
    let hash = server.publish_blob(content);
    server.publish_manifest(&mut server.manifest(42, vec![("app.jar", content)]));

    let mut shell = TestShell::new(&server, 1);
    let launcher = RecordingLauncher::with_exit(0);
    assert_eq!(
        shell.engine.validate_and_launch(&launcher).await,
        LaunchOutcome::Exited(0)
    );
    shell.drain_events();

    let link = shell.version_dir(42).join("app.jar");
    std::fs::remove_file(&link).unwrap();
    std::fs::write(&link, b"a stray regular file").unwrap();

    assert_eq!(
        shell.engine.validate_and_launch(&launcher).await,
        LaunchOutcome::Exited(0)
    );
    let events = shell.drain_events();
    assert!(
        !events.iter().any(|e| matches!(e, UpdateEvent::Downloading(_))),
        "repair must not download: {events:?}"
    );
    assert_file_links_to(&link, &shell.cas_blob(&hash), content);
}

// S6: a manifest demanding a newer shell stops the flow before download.
#[tokio::test]
async fn old_shell_is_sent_to_the_update_url() {
    let server = TestServer::new();
    let content = b"future payload";
    server.publish_blob(content);
    let mut manifest = server.manifest(50, vec![("app.jar", content)]);
    manifest.min_shell_version = 10;
    server.publish_manifest(&mut manifest);

    // Install with a current shell first so the manifest is on disk.
    let current = TestShell::new(&server, 10);
    assert!(matches!(
        current.engine.download_latest().await,
        DownloadResult::Success
    ));
    drop(current.engine);
    let bundle_dir = current.bundle_dir.clone();

    // An old shell pointed at the same app data directory must refuse.
    let old_dir = bundle_dir.parent().unwrap().to_path_buf();
    let config = EngineConfig::new(
        old_dir,
        server.base_url(),
        server.key.verifying_key(),
        5,
        server.platform,
    )
    .bundle_subdirectory("bundle");
    let fetcher = HttpFetcher::builder()
        .base_url(server.base_url())
        .build()
        .unwrap();
    let (engine, mut events) = UpdateEngine::new(config, fetcher).unwrap();

    let launcher = RecordingLauncher::with_exit(0);
    assert_eq!(
        engine.validate_and_launch(&launcher).await,
        LaunchOutcome::ShellUpdateRequired
    );
    assert!(launcher.launched().is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|event| matches!(
        event,
        UpdateEvent::ShellUpdateRequired {
            current: 5,
            required: 10,
            update_url: Some(url)
        } if url == "https://example.com/get-shell"
    )));
}

// Crash between prepare_version and save_manifest: partial version dirs
// without a manifest read as "no bundle" and the engine recovers.
#[tokio::test]
async fn partial_version_directory_is_no_bundle_and_recovers() {
    let server = TestServer::new();
    let content = b"recovered content";
    server.publish_blob(content);
    server.publish_manifest(&mut server.manifest(100, vec![("app.jar", content)]));

    let shell = TestShell::new(&server, 1);
    std::fs::create_dir_all(shell.version_dir(100)).unwrap();
    std::fs::write(shell.version_dir(100).join("leftover"), b"partial").unwrap();

    assert!(matches!(
        shell.engine.validate().await,
        ValidationResult::NoBundle
    ));

    let launcher = RecordingLauncher::with_exit(3);
    assert_eq!(
        shell.engine.validate_and_launch(&launcher).await,
        LaunchOutcome::Exited(3)
    );
    assert!(matches!(
        shell.engine.validate().await,
        ValidationResult::Valid { .. }
    ));
}

// The full-archive strategy end to end, with a real ZIP.
#[tokio::test]
async fn small_archive_is_fetched_as_one_zip() {
    let server = TestServer::new();
    let alpha = b"alpha payload";
    let beta = b"beta payload";
    let size = server.publish_archive("bundle.zip", &[alpha, beta]);
    // No per-file blobs are published: only the archive path can succeed.
    server.publish_manifest(&mut server.manifest_with_archive(
        5,
        vec![("alpha.bin", alpha), ("beta.bin", beta)],
        "bundle.zip",
        size,
    ));

    let shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::Success
    ));

    assert_file_links_to(
        &shell.version_dir(5).join("alpha.bin"),
        &shell.cas_blob(&FileHash::of_bytes(alpha)),
        alpha,
    );
    assert_file_links_to(
        &shell.version_dir(5).join("beta.bin"),
        &shell.cas_blob(&FileHash::of_bytes(beta)),
        beta,
    );
}

// An empty file list still finalizes: the version directory exists and
// validation succeeds.
#[tokio::test]
async fn empty_bundle_finalizes_and_validates() {
    let server = TestServer::new();
    server.publish_manifest(&mut server.manifest(1, vec![]));

    let shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::Success
    ));
    assert!(shell.version_dir(1).is_dir());
    assert!(matches!(
        shell.engine.validate().await,
        ValidationResult::Valid { .. }
    ));
}

// Unknown manifest fields survive byte-for-byte and stay signed.
#[tokio::test]
async fn unknown_manifest_fields_are_preserved_on_disk() {
    let server = TestServer::new();
    let content = b"forward compatible";
    server.publish_blob(content);

    let mut manifest = server.manifest(10, vec![("app.jar", content)]);
    let mut value: serde_json::Value =
        serde_json::from_slice(&bundle_engine::canonical_bytes(&manifest).unwrap()).unwrap();
    value["signature"] = serde_json::Value::String(String::new());
    value["rolloutStage"] = serde_json::json!("beta");
    let payload = serde_json::to_vec(&value).unwrap();
    manifest.signature = bundle_engine::encode_signature(&server.key.sign(&payload));
    value["signature"] = serde_json::Value::String(manifest.signature.clone());
    let wire = serde_json::to_vec(&value).unwrap();
    std::fs::write(server.dir.path().join("manifest.json"), &wire).unwrap();

    let shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.download_latest().await,
        DownloadResult::Success
    ));
    assert_eq!(std::fs::read(shell.manifest_path()).unwrap(), wire);
    assert!(matches!(
        shell.engine.validate().await,
        ValidationResult::Valid { .. }
    ));
}

// Background cycle: a newer build supersedes the old one and cleanup
// reclaims everything unreachable.
#[tokio::test]
async fn background_cycle_updates_then_cleans_up() {
    let server = TestServer::new();
    let old_content = b"old generation";
    let old_hash = server.publish_blob(old_content);
    server.publish_manifest(&mut server.manifest(1, vec![("app.jar", old_content)]));

    let mut shell = TestShell::new(&server, 1);
    assert!(matches!(
        shell.engine.check_and_download().await,
        DownloadResult::Success
    ));
    shell.drain_events();

    let new_content = b"new generation";
    let new_hash = server.publish_blob(new_content);
    server.publish_manifest(&mut server.manifest(2, vec![("app.jar", new_content)]));

    assert!(matches!(
        shell.engine.check_and_download().await,
        DownloadResult::Success
    ));
    let events = shell.drain_events();
    let stats = events
        .iter()
        .find_map(|event| match event {
            UpdateEvent::CleanupComplete(stats) => Some(stats.clone()),
            _ => None,
        })
        .expect("cleanup ran after a successful update");
    assert_eq!(stats.versions_removed, vec![1]);
    assert_eq!(stats.cas_files_removed, 1);

    assert!(!shell.version_dir(1).exists());
    assert!(!shell.cas_blob(&old_hash).exists());
    assert!(shell.cas_blob(&new_hash).exists());

    // A further cycle is a no-op apart from confirming up-to-date status.
    assert!(matches!(
        shell.engine.check_and_download().await,
        DownloadResult::AlreadyUpToDate
    ));
    let events = shell.drain_events();
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::UpToDate)));
}

// A manifest that does not declare the running platform is terminal.
#[tokio::test]
async fn foreign_platform_manifest_is_rejected() {
    let server = TestServer::new();
    let content = b"other platform";
    server.publish_blob(content);
    let mut manifest = server.manifest(30, vec![("app.jar", content)]);
    let archive = manifest.zips.remove(&server.platform).unwrap();
    let foreign = if server.platform.os == bundle_engine::Os::Linux {
        Platform::new(bundle_engine::Os::Macos, server.platform.arch)
    } else {
        Platform::new(bundle_engine::Os::Linux, server.platform.arch)
    };
    manifest.zips.insert(foreign, archive);
    server.publish_manifest(&mut manifest);

    let shell = TestShell::new(&server, 1);
    match shell.engine.download_latest().await {
        DownloadResult::Failed(EngineError::PlatformUnsupported(_)) => {}
        other => panic!("expected platform rejection, got {other:?}"),
    }
    assert!(!shell.manifest_path().exists());
}
