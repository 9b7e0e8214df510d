//! In-memory object store for tests.

use super::{ListingPage, ObjectEntry, ObjectStore};
use crate::utils::errors::{ArchiveError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    failing_keys: Mutex<HashSet<String>>,
    downloads: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
    }

    /// Store an object of `size` bytes filled with a key-derived byte.
    pub fn put(&self, bucket: &str, key: &str, size: usize) {
        let fill = key.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), vec![fill; size]);
    }

    /// Make downloads of `bucket/key` fail.
    pub fn fail_on(&self, bucket: &str, key: &str) {
        self.failing_keys
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"));
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(self.buckets.lock().unwrap().keys().cloned().collect())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        page_size: usize,
        continuation_token: Option<String>,
    ) -> Result<ListingPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| ArchiveError::Store(format!("no such bucket: {bucket}")))?;

        // Tokens are plain offsets into the sorted key list.
        let start: usize = match continuation_token {
            Some(token) => token
                .parse()
                .map_err(|_| ArchiveError::Store(format!("bad continuation token {token}")))?,
            None => 0,
        };

        let entries: Vec<ObjectEntry> = objects
            .iter()
            .skip(start)
            .take(page_size)
            .map(|(key, data)| ObjectEntry {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect();
        let next = start + entries.len();
        let is_truncated = next < objects.len();

        Ok(ListingPage {
            entries,
            is_truncated,
            next_continuation_token: is_truncated.then(|| next.to_string()),
        })
    }

    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64> {
        if self
            .failing_keys
            .lock()
            .unwrap()
            .contains(&format!("{bucket}/{key}"))
        {
            return Err(ArchiveError::Store(format!("injected failure for {bucket}/{key}")));
        }

        let data = self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| ArchiveError::Store(format!("no such key: {bucket}/{key}")))?;

        std::fs::write(local_path, &data)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(data.len() as u64)
    }
}
