//! S3 Archive Library
//!
//! Mirrors object-store buckets into local storage. Objects below a size
//! threshold are packed into one uncompressed container per bucket and day,
//! deduplicated against the manifests of earlier runs.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod lock;
pub mod store;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, SourceConfig};
pub use utils::errors::ArchiveError;
pub type Result<T> = std::result::Result<T, ArchiveError>;
