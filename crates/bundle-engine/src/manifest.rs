//! Manifest data model, canonical encoding, and platform filtering.
//!
//! A manifest travels as raw JSON bytes whose signature covers the same
//! bytes with the signature value blanked. The raw form is kept from fetch
//! through save so unknown fields introduced by newer producers stay under
//! the signature; [`ManifestDocument`] carries both views.

use crate::error::{EngineError, Result};
use crate::hash::FileHash;
use crate::platform::{Arch, Os, Platform};
use crate::signing;
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Manifest schema revision this engine understands.
pub const SCHEMA_VERSION: u32 = 1;

/// One file of the bundle: a relative path bound to a content hash.
///
/// The same hash may appear on several paths; platform tags narrow the file
/// to one OS or one OS/arch pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleFile {
    pub path: String,
    pub hash: FileHash,
    pub size: u64,
    #[serde(default)]
    pub os: Option<Os>,
    #[serde(default)]
    pub arch: Option<Arch>,
}

impl BundleFile {
    /// Whether this file belongs to the given platform under the two-step
    /// filtering rule.
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.os.map_or(true, |os| os == platform.os)
            && self.arch.map_or(true, |arch| arch == platform.arch)
    }
}

/// A content-addressed full archive published for one platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformArchive {
    /// Relative URL of the ZIP on the server.
    #[serde(rename = "zip")]
    pub zip_path: String,
    pub size: u64,
}

/// The authoritative, signed description of a single build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub schema_version: u32,
    /// Monotonically increasing identity of the build.
    pub build_number: u64,
    /// ISO-8601 creation timestamp; informational only.
    pub created_at: String,
    /// Shells older than this must refuse to launch the bundle.
    pub min_shell_version: u32,
    #[serde(default)]
    pub shell_update_url: Option<String>,
    pub files: Vec<BundleFile>,
    /// Opaque entry-point name handed to the loader.
    pub main_class: String,
    /// Presence of a platform key declares support for that platform.
    pub zips: BTreeMap<Platform, PlatformArchive>,
    /// `ed25519:<base64>` over the canonical bytes with this field blanked.
    pub signature: String,
}

impl BundleManifest {
    /// Check the structural invariants that parsing alone cannot enforce.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(EngineError::ManifestInvalid(format!(
                "unsupported schema version {}",
                self.schema_version
            )));
        }
        if self.zips.is_empty() {
            return Err(EngineError::ManifestInvalid(
                "manifest declares no platforms".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(self.files.len());
        for file in &self.files {
            check_relative_path(&file.path)?;
            if !seen.insert(file.path.as_str()) {
                return Err(EngineError::ManifestInvalid(format!(
                    "duplicate path {:?}",
                    file.path
                )));
            }
        }
        Ok(())
    }

    /// Whether the manifest supports the given platform at all.
    pub fn supports(&self, platform: Platform) -> bool {
        self.zips.contains_key(&platform)
    }

    /// The files applicable to one platform.
    ///
    /// This is the single filtering rule every component goes through when
    /// enumerating "the files I care about".
    pub fn files_for_platform(&self, platform: Platform) -> impl Iterator<Item = &BundleFile> {
        self.files.iter().filter(move |f| f.applies_to(platform))
    }

    /// The full archive published for one platform, if declared.
    pub fn archive_for(&self, platform: Platform) -> Option<&PlatformArchive> {
        self.zips.get(&platform)
    }

    /// Total uncompressed payload size for one platform.
    pub fn total_size_for(&self, platform: Platform) -> u64 {
        self.files_for_platform(platform).map(|f| f.size).sum()
    }
}

/// Relative paths must stay inside the version directory: forward slashes,
/// no `.`/`..` components, no leading slash, no drive letters.
fn check_relative_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.contains(':')
        || path
            .split('/')
            .any(|component| component.is_empty() || component == "." || component == "..")
    {
        return Err(EngineError::ManifestInvalid(format!(
            "invalid file path {path:?}"
        )));
    }
    Ok(())
}

/// Canonical JSON encoding of a manifest: schema field order, sorted
/// platform keys, no insignificant whitespace, unquoted integers.
pub fn canonical_bytes(manifest: &BundleManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(manifest)?)
}

/// The bytes a signer signs: the canonical encoding with `signature` blank.
pub fn signing_payload(manifest: &BundleManifest) -> Result<Vec<u8>> {
    let mut unsigned = manifest.clone();
    unsigned.signature = String::new();
    canonical_bytes(&unsigned)
}

/// A manifest as fetched: the exact wire bytes plus the parsed view.
///
/// Verification and saving always use the raw bytes; the parsed view serves
/// lookups. Keeping both is what lets unknown fields survive round trips
/// while staying covered by the signature.
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    raw: Bytes,
    manifest: BundleManifest,
}

impl ManifestDocument {
    /// Parse raw wire bytes, enforcing the structural invariants.
    pub fn parse(raw: Bytes) -> Result<Self> {
        let manifest: BundleManifest = serde_json::from_slice(&raw)?;
        manifest.validate()?;
        Ok(ManifestDocument { raw, manifest })
    }

    /// The exact bytes received from the wire (or read from disk).
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The parsed view.
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Recover the signed payload from the wire bytes.
    ///
    /// The producer serialized the manifest canonically with an empty
    /// signature, signed those bytes, then filled the field in. Blanking
    /// the signature value inside the raw bytes reproduces the payload
    /// byte-for-byte, unknown fields included — no re-encoding happens.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let raw = std::str::from_utf8(&self.raw)
            .map_err(|_| EngineError::ManifestInvalid("manifest is not UTF-8".into()))?;
        let needle = format!("\"signature\":\"{}\"", self.manifest.signature);
        let position = raw.find(&needle).ok_or_else(|| {
            EngineError::ManifestInvalid("signature field is not in canonical form".into())
        })?;
        let mut payload = Vec::with_capacity(self.raw.len());
        payload.extend_from_slice(&self.raw[..position]);
        payload.extend_from_slice(b"\"signature\":\"\"");
        payload.extend_from_slice(&self.raw[position + needle.len()..]);
        Ok(payload)
    }

    /// Verify the manifest signature against the shell-configured key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let payload = self.signing_bytes()?;
        signing::verify_detached(key, &payload, &self.manifest.signature)
    }
}
