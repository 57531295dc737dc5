//! Target platform identification.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Operating systems a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Macos,
    Linux,
    Windows,
}

impl Os {
    fn as_str(&self) -> &'static str {
        match self {
            Os::Macos => "macos",
            Os::Linux => "linux",
            Os::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "macos" => Ok(Os::Macos),
            "linux" => Ok(Os::Linux),
            "windows" => Ok(Os::Windows),
            other => Err(EngineError::ManifestInvalid(format!(
                "unknown os: {other:?}"
            ))),
        }
    }
}

/// CPU architectures a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    X64,
}

impl Arch {
    fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X64 => "x64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arm64" => Ok(Arch::Arm64),
            "x64" => Ok(Arch::X64),
            other => Err(EngineError::ManifestInvalid(format!(
                "unknown arch: {other:?}"
            ))),
        }
    }
}

/// An `{os}-{arch}` pair, e.g. `linux-x64`.
///
/// Appears both as the configured target platform and as the key set of a
/// manifest's `zips` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub fn new(os: Os, arch: Arch) -> Self {
        Platform { os, arch }
    }

    /// Detect the platform this process is running on.
    pub fn detect() -> Result<Self> {
        let os = if cfg!(target_os = "macos") {
            Os::Macos
        } else if cfg!(target_os = "linux") {
            Os::Linux
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            return Err(EngineError::validation(format!(
                "unsupported operating system: {}",
                std::env::consts::OS
            )));
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "x86_64") {
            Arch::X64
        } else {
            return Err(EngineError::validation(format!(
                "unsupported architecture: {}",
                std::env::consts::ARCH
            )));
        };
        Ok(Platform { os, arch })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (os, arch) = s.split_once('-').ok_or_else(|| {
            EngineError::ManifestInvalid(format!("malformed platform id: {s:?}"))
        })?;
        Ok(Platform {
            os: os.parse()?,
            arch: arch.parse()?,
        })
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
