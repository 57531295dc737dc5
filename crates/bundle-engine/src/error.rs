/// Convenient result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while storing, validating, or updating a bundle.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Transport-level failure (TCP reset, DNS failure, interrupted body read).
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a retryable status (408, 429, 5xx).
    #[error("server returned status {0} for {1}")]
    HttpRetryable(u16, String),
    /// The server rejected the request (4xx other than 408/429).
    #[error("request rejected with status {0} for {1}")]
    HttpRejected(u16, String),
    /// The manifest could not be decoded from JSON.
    #[error("manifest decoding failed: {0}")]
    ManifestDecode(#[from] serde_json::Error),
    /// The manifest decoded but violates a structural invariant.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),
    /// The Ed25519 check over the raw manifest bytes failed.
    #[error("manifest signature invalid")]
    SignatureInvalid,
    /// The manifest does not declare the running platform.
    #[error("manifest does not support platform {0}")]
    PlatformUnsupported(String),
    /// A downloaded blob hashed to something other than the manifest said.
    #[error("corrupted download (expected {expected}, got {actual})")]
    HashMismatch {
        /// Digest declared by the manifest or archive entry.
        expected: String,
        /// Digest actually computed over the received bytes.
        actual: String,
    },
    /// A blob referenced during materialization is missing from the store.
    #[error("blob missing from store: {0}")]
    MissingFromStore(String),
    /// A filesystem mutation (link, rename, delete) failed.
    #[error("filesystem operation failed: {0}")]
    Filesystem(#[source] std::io::Error),
    /// An external cancel signal stopped the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }

    /// Wrap a transport failure.
    pub fn network(err: impl std::fmt::Display) -> Self {
        EngineError::Network(err.to_string())
    }

    /// Wrap a failed filesystem mutation.
    pub fn fs(err: std::io::Error) -> Self {
        EngineError::Filesystem(err)
    }

    /// Whether the engine's backoff loop may absorb this error and try again.
    ///
    /// Signature, platform, and hash failures are final: retrying the same
    /// request cannot change their outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::HttpRetryable(..)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_error_class() {
        assert!(EngineError::Network("reset".into()).is_retryable());
        assert!(EngineError::HttpRetryable(503, "x".into()).is_retryable());
        assert!(!EngineError::HttpRejected(404, "x".into()).is_retryable());
        assert!(!EngineError::SignatureInvalid.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::HashMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }
}
