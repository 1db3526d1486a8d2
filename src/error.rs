//! Error taxonomy shared by every layer of the token engine.
//!
//! Codec, keyring, cipher and catalog operations all return [`WebAuthError`].
//! The redirect flow wraps it in its own `FlowError` for the few failures that
//! are fatal for a request.

use std::path::PathBuf;

/// Result alias used throughout the crate
pub type Result<T, E = WebAuthError> = std::result::Result<T, E>;

/// Error types for token, keyring and credential operations
#[derive(Debug, thiserror::Error)]
pub enum WebAuthError {
    /// Output buffer too small. Kept for parity with the wire protocol's
    /// status codes; dynamic buffers never produce it.
    #[error("No room in buffer")]
    NoRoom,
    #[error("Corrupt data: {0}")]
    Corrupt(String),
    #[error("Integrity check failed")]
    BadIntegrity,
    #[error("Unusable key: {0}")]
    BadKey(String),
    #[error("Token expired: {0}")]
    Expired(String),
    #[error("Attribute not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Out of memory")]
    NoMemory,
    #[error("Unsupported keyring version {0}")]
    KeyringVersion(u32),
    #[error("Keyring I/O failed for {path}: {source}")]
    KeyringIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("External collaborator failed: {0}")]
    External(String),
}

impl WebAuthError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for failures caused by the token itself rather than the local setup
    #[must_use]
    pub fn is_token_failure(&self) -> bool {
        matches!(
            self,
            Self::Corrupt(_)
                | Self::BadIntegrity
                | Self::Expired(_)
                | Self::NotFound(_)
                | Self::InvalidInput(_)
        )
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_failure_classification() {
        assert!(WebAuthError::BadIntegrity.is_token_failure());
        assert!(WebAuthError::corrupt("x").is_token_failure());
        assert!(!WebAuthError::BadKey("empty".into()).is_token_failure());
        assert!(!WebAuthError::KeyringVersion(7).is_token_failure());
    }

    #[test]
    fn test_display_names_cause() {
        let err = WebAuthError::External("kdc unreachable".into());
        assert_eq!(err.to_string(), "External collaborator failed: kdc unreachable");
    }
}
