//! Error taxonomy for admission, conversion and storage.

use std::path::PathBuf;
use thiserror::Error;

/// Transient-storage and table errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Policy rejections raised before a job exists. Never retried.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unsupported media type: {0}")]
    UnsupportedType(String),

    #[error("{}", file_too_large_message(.size, .limit, .upgrade_hint))]
    FileTooLarge {
        size: u64,
        limit: u64,
        /// Set when a premium upgrade would raise the ceiling
        upgrade_hint: bool,
    },

    #[error("conversion quota exceeded: {quota} per {window_secs}s window")]
    QuotaExceeded { quota: u32, window_secs: u64 },

    #[error("upload is empty")]
    EmptyUpload,

    #[error("declared size {declared} bytes does not match the {observed} bytes received")]
    SizeMismatch { declared: u64, observed: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AdmissionError {
    /// Whether the caller should be pointed at the premium tier
    pub fn upgrade_hint(&self) -> bool {
        matches!(self, AdmissionError::FileTooLarge { upgrade_hint: true, .. })
    }
}

fn file_too_large_message(size: &u64, limit: &u64, upgrade_hint: &bool) -> String {
    use humansize::{format_size, BINARY};

    let mut msg = format!(
        "file too large: {} exceeds the {} limit",
        format_size(*size, BINARY),
        format_size(*limit, BINARY)
    );
    if *upgrade_hint {
        msg.push_str(" (upgrade to premium for larger uploads)");
    }
    msg
}

/// Encoder-time failures; each one terminates the job as `Failed`.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to spawn encoder: {0}")]
    SpawnFailure(String),

    #[error("encoder exited with status {code:?}: {stderr_tail}")]
    EncoderNonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("encoder timed out after {secs} seconds and was killed")]
    EncoderTimeout { secs: u64 },

    #[error("encoder produced no output")]
    EmptyOutput,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} has not finished")]
    NotReady(String),

    #[error("job {0} was reclaimed before it finished")]
    Orphaned(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConversionError {
    /// Only spawn failures are treated as transient
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConversionError::SpawnFailure(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_too_large_carries_upgrade_hint() {
        let err = AdmissionError::FileTooLarge {
            size: 150 * 1024 * 1024,
            limit: 100 * 1024 * 1024,
            upgrade_hint: true,
        };
        assert!(err.upgrade_hint());
        let msg = err.to_string();
        assert!(msg.contains("150") && msg.contains("MiB"), "{}", msg);
        assert!(msg.contains("upgrade"), "{}", msg);

        let premium = AdmissionError::FileTooLarge {
            size: 3000,
            limit: 2000,
            upgrade_hint: false,
        };
        assert!(!premium.upgrade_hint());
        assert!(!premium.to_string().contains("upgrade"));
    }

    #[test]
    fn test_only_spawn_failure_is_retryable() {
        assert!(ConversionError::SpawnFailure("EAGAIN".into()).is_retryable());
        assert!(!ConversionError::EncoderTimeout { secs: 1 }.is_retryable());
        assert!(!ConversionError::EncoderNonZeroExit {
            code: Some(1),
            stderr_tail: String::new()
        }
        .is_retryable());
    }
}
