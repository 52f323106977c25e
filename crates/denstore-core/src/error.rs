//! Error types for DenStore operations
//!
//! All DenStore errors are represented by the DenError enum, which provides
//! detailed context for debugging and recovery. None of these escape the
//! engine's record-store operations — they are converted to safe defaults
//! (absent values, empty lists, boolean failure signals) at that surface.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// DenStore error types with detailed context
#[derive(Debug, Clone)]
pub enum DenError {
    /// I/O operation failed in the file backend
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Write rejected because it would exceed the backing store's byte quota
    QuotaExceeded {
        /// Key whose write was rejected
        key: String,
        /// Size of the rejected value in bytes
        attempted_bytes: u64,
        /// Configured quota in bytes
        quota_bytes: u64,
    },

    /// The backing store failed its availability probe or a non-quota write
    BackendUnavailable {
        /// Description of the failure that triggered the switch
        reason: String,
    },

    /// Stored value failed structural validation on load
    CorruptedRecord {
        /// Key holding the corrupted value
        key: String,
        /// What the validator rejected
        reason: String,
    },

    /// Record (de)serialization failed
    Serde {
        /// Key involved, if the failure is tied to one
        key: Option<String>,
        /// Underlying serde_json message
        reason: String,
    },
}

impl DenError {
    /// Whether this error is the backend's quota rejection.
    ///
    /// The write path treats quota rejections specially (prune, then retry
    /// once); every other failure switches the engine to the memory mirror.
    pub fn is_quota(&self) -> bool {
        matches!(self, DenError::QuotaExceeded { .. })
    }
}

impl fmt::Display for DenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            DenError::QuotaExceeded { key, attempted_bytes, quota_bytes } => {
                write!(f, "Quota exceeded writing {}: {} bytes rejected, quota {} bytes",
                       key, attempted_bytes, quota_bytes)
            }

            DenError::BackendUnavailable { reason } => {
                write!(f, "Backing store unavailable: {}", reason)
            }

            DenError::CorruptedRecord { key, reason } => {
                write!(f, "Corrupted record under {}: {}", key, reason)
            }

            DenError::Serde { key, reason } => {
                if let Some(key) = key {
                    write!(f, "Serialization error for {}: {}", key, reason)
                } else {
                    write!(f, "Serialization error: {}", reason)
                }
            }
        }
    }
}

impl Error for DenError {}

/// Convert std::io::Error to DenError::Io
impl From<std::io::Error> for DenError {
    fn from(err: std::io::Error) -> Self {
        DenError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Convert serde_json::Error to DenError::Serde
impl From<serde_json::Error> for DenError {
    fn from(err: serde_json::Error) -> Self {
        DenError::Serde {
            key: None,
            reason: err.to_string(),
        }
    }
}

/// Result type alias for DenStore operations
pub type DenResult<T> = Result<T, DenError>;
