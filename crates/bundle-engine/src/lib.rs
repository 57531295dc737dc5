//! Signed, content-addressed bundle storage and update engine.
//!
//! This crate keeps an application bundle installed and current on an
//! end-user machine. Bundles are described by Ed25519-signed manifests; the
//! blobs they reference live in a content-addressable store and are
//! materialized into per-build version directories by linking. The engine
//! fetches manifests, chooses between a full-archive and a per-file
//! download, verifies every byte against its digest, finalizes versions
//! atomically, validates and repairs installed bundles at startup, and
//! cleans up superseded state once it knows it is up to date.
//!
//! ```ignore
//! use bundle_engine::{
//!     EngineConfig, HttpFetcher, LaunchOutcome, Platform, ProcessLauncher, UpdateEngine,
//! };
//!
//! # async fn demo(public_key: ed25519_dalek::VerifyingKey) -> bundle_engine::Result<()> {
//! let base_url = reqwest::Url::parse("https://updates.example.com/app/").unwrap();
//! let config = EngineConfig::new("/home/user/.example", base_url.clone(), public_key, 1,
//!     Platform::detect()?);
//! let fetcher = HttpFetcher::builder().base_url(base_url).build()?;
//! let (engine, mut events) = UpdateEngine::new(config, fetcher)?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{event}");
//!     }
//! });
//!
//! match engine.validate_and_launch(&ProcessLauncher::new()).await {
//!     LaunchOutcome::Exited(code) => std::process::exit(code),
//!     outcome => eprintln!("bundle did not launch: {outcome:?}"),
//! }
//! # Ok(())
//! # }
//! ```

mod cas;
mod cleanup;
mod config;
mod decide;
mod download;
mod engine;
mod error;
mod events;
mod fetch;
mod hash;
mod launch;
mod manifest;
mod platform;
mod signing;
mod storage;
mod validate;

pub use cas::ContentStore;
pub use cleanup::{CleanupManager, CleanupStats};
pub use config::{EngineConfig, RetryPolicy};
pub use decide::{plan_download, DownloadPlan, PER_REQUEST_OVERHEAD};
pub use download::Downloader;
pub use engine::{DownloadResult, LaunchOutcome, UpdateEngine};
pub use error::{EngineError, Result};
pub use events::{EventSender, TransferProgress, UpdateEvent};
pub use fetch::{
    ByteStream, FetchResponse, Fetcher, HttpFetcher, HttpFetcherBuilder, MAX_PARALLEL_TRANSFERS,
};
pub use hash::{FileHash, StreamingHasher, HASH_ALGORITHM};
pub use launch::{BundleLauncher, ExitNotifier, LaunchConfig, LaunchRequest, ProcessLauncher};
pub use manifest::{
    canonical_bytes, signing_payload, BundleFile, BundleManifest, ManifestDocument,
    PlatformArchive, SCHEMA_VERSION,
};
pub use platform::{Arch, Os, Platform};
pub use signing::{
    encode_public_key, encode_signature, parse_public_key, parse_signature, verify_detached,
    SIGNATURE_PREFIX,
};
pub use storage::{StorageManager, WriteScope, MANIFEST_FILE};
pub use validate::{FileFailure, ValidationResult, Validator};
