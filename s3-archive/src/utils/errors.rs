//! Custom error types for the archive job.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Container error: {0}")]
    Container(#[from] zip::result::ZipError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Container {0} is already closed")]
    PackerClosed(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Another instance holds the lock file {0}")]
    LockHeld(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error(
        "Getting close to the quota limit for {sources:?}! Please check the quota limits \
         in the configuration files and/or request a higher quota."
    )]
    QuotaExceeded { sources: Vec<String> },

    #[error("Source {source_name}: {} bucket(s) failed: {buckets:?}", buckets.len())]
    BucketsFailed {
        source_name: String,
        buckets: Vec<String>,
    },
}

impl ArchiveError {
    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ArchiveError::QuotaExceeded { .. } => 2,
            ArchiveError::LockHeld(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let quota = ArchiveError::QuotaExceeded {
            sources: vec!["prod".to_string()],
        };
        assert_eq!(quota.exit_code(), 2);
        assert_eq!(ArchiveError::LockHeld("x.lock".to_string()).exit_code(), 3);
        assert_eq!(ArchiveError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_quota_message_names_sources() {
        let err = ArchiveError::QuotaExceeded {
            sources: vec!["alpha".to_string(), "beta".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains("beta"));
    }
}
