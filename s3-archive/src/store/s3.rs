//! S3-compatible object store using the AWS SDK.

use super::{ListingPage, ObjectEntry, ObjectStore};
use crate::config::SourceConfig;
use crate::utils::errors::{ArchiveError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

fn store_error<E>(context: String, err: aws_sdk_s3::error::SdkError<E>) -> ArchiveError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ArchiveError::Store(format!("{context}: {}", DisplayErrorContext(&err)))
}

/// Client for a single source's S3 endpoint.
pub struct S3Store {
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the source's static credentials. Requests always go
    /// over the configured endpoint with path-style addressing.
    pub fn from_source(source: &SourceConfig) -> Self {
        let credentials = Credentials::new(
            source.s3_access_key_id.clone(),
            source.s3_secret_access_key.clone(),
            None,
            None,
            "s3-archive-source",
        );

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(source.s3_region.clone()))
            .endpoint_url(source.s3_endpoint_url.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            endpoint: source.s3_endpoint_url.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| store_error(format!("list buckets at {}", self.endpoint), e))?;

        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        page_size: usize,
        continuation_token: Option<String>,
    ) -> Result<ListingPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(page_size as i32)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| store_error(format!("list objects in {bucket}"), e))?;

        let entries = resp
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                let size = obj.size().unwrap_or(0).max(0) as u64;
                Some(ObjectEntry { key, size })
            })
            .collect();

        Ok(ListingPage {
            entries,
            is_truncated: resp.is_truncated().unwrap_or(false),
            next_continuation_token: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(format!("get {bucket}/{key}"), e))?;

        let mut reader = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(bucket = %bucket, key = %key, bytes = written, "Downloaded object");
        Ok(written)
    }
}
