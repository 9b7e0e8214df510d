//! Object store capability consumed by the archive job.

pub mod s3;

#[cfg(test)]
pub(crate) mod memory;

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::Path;

pub use s3::S3Store;

/// A single listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// One page of a bucket listing
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub entries: Vec<ObjectEntry>,
    /// More pages follow
    pub is_truncated: bool,
    /// Token to pass to the next `list_objects` call
    pub next_continuation_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names of every bucket visible to the credentials.
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Fetch one page of at most `page_size` keys.
    async fn list_objects(
        &self,
        bucket: &str,
        page_size: usize,
        continuation_token: Option<String>,
    ) -> Result<ListingPage>;

    /// Download an object to `local_path`, returning the number of bytes written.
    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64>;
}
