//! Archive executor - Orchestrates the archival of every configured source.
//!
//! For each source the buckets are listed and filtered, each included bucket
//! is paged through, and every object matching the key filter is either
//! downloaded as an individual file or packed into the bucket's small-object
//! container, depending on its size.

pub mod download;
pub mod filter;
pub mod manifest;
pub mod packer;

use crate::config::{Config, SourceConfig};
use crate::store::{ObjectEntry, ObjectStore};
use crate::transfer::progress::{format_bytes, format_duration, TransferTally};
use crate::utils::errors::{ArchiveError, Result};
use chrono::NaiveDate;
use download::download_if_absent;
use filter::NameFilter;
use futures_util::stream::{self, StreamExt};
use packer::ObjectPacker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Archived objects between two progress lines.
const PROGRESS_INTERVAL: usize = 100;

/// Number of semaphore permits a transfer takes out of `budget`.
/// Small objects run side by side, large ones get the bandwidth to themselves.
///
/// | Object size      | Permits      |
/// |------------------|--------------|
/// | < 10 MiB         | 1            |
/// | 10 – 100 MiB     | budget / 8   |
/// | 100 MiB – 1 GiB  | budget / 2   |
/// | ≥ 1 GiB          | budget       |
fn concurrency_weight(size: u64, budget: u32) -> u32 {
    let budget = budget.max(1);
    let share = match size {
        0..=10_485_759 => 1,
        10_485_760..=104_857_599 => budget / 8,
        104_857_600..=1_073_741_823 => budget / 2,
        _ => budget,
    };
    share.max(1).min(budget)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Downloaded as an individual file
    Direct,
    /// Packed into the bucket's container
    Packed,
}

/// Tallies for one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub buckets_included: usize,
    pub buckets_excluded: usize,
    pub buckets_failed: usize,
    pub objects_archived: usize,
    pub objects_archived_small: usize,
    pub objects_excluded: usize,
    /// Size of every object matching the key filter
    pub bytes_observed: u64,
    /// Bytes downloaded during this run
    pub bytes_transferred: u64,
}

impl RunCounters {
    fn merge(&mut self, other: &RunCounters) {
        self.buckets_included += other.buckets_included;
        self.buckets_excluded += other.buckets_excluded;
        self.buckets_failed += other.buckets_failed;
        self.objects_archived += other.objects_archived;
        self.objects_archived_small += other.objects_archived_small;
        self.objects_excluded += other.objects_excluded;
        self.bytes_observed += other.bytes_observed;
        self.bytes_transferred += other.bytes_transferred;
    }
}

/// Result of archiving one source
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub name: String,
    /// `bytes_observed / s3_quota`
    pub quota_used: f64,
    pub counters: RunCounters,
    pub failed_buckets: Vec<String>,
    pub elapsed_secs: u64,
}

impl SourceReport {
    pub fn over_quota(&self, threshold: f64) -> bool {
        self.quota_used > threshold
    }

    /// Human-readable end-of-run summary
    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "Summary for {name}:\n\
             \x20   Buckets archived: {}\n\
             \x20   Buckets ignored: {}\n\
             \x20   Buckets failed: {}\n\
             \x20   Objects archived: {}\n\
             \x20   Objects archived small: {}\n\
             \x20   Objects ignored due to regexp: {}\n\
             \x20   Total archive size: {} ({:.0}%)\n\
             \x20   Added to the archive: {}\n\
             \x20   Duration: {}",
            c.buckets_included,
            c.buckets_excluded,
            c.buckets_failed,
            c.objects_archived,
            c.objects_archived_small,
            c.objects_excluded,
            format_bytes(c.bytes_observed),
            self.quota_used * 100.0,
            format_bytes(c.bytes_transferred),
            format_duration(self.elapsed_secs),
            name = self.name,
        )
    }
}

/// Names of the sources whose quota usage exceeds `threshold`.
pub fn quota_alerts(reports: &[SourceReport], threshold: f64) -> Vec<String> {
    reports
        .iter()
        .filter(|r| r.over_quota(threshold))
        .map(|r| r.name.clone())
        .collect()
}

/// Knobs shared by every source of a run
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub page_size: usize,
    pub packing: bool,
    pub max_concurrent_buckets: usize,
    pub concurrency_budget: u32,
    pub quota_alert_threshold: f64,
    /// Emit a progress line every 100 archived objects
    pub progress: bool,
    /// Selects the day's container
    pub date: NaiveDate,
}

impl ArchiveOptions {
    pub fn from_config(config: &Config, progress: bool) -> Self {
        Self {
            page_size: config.archive.page_size,
            packing: config.archive.packing,
            max_concurrent_buckets: config.performance.max_concurrent_buckets,
            concurrency_budget: config.performance.concurrency_budget,
            quota_alert_threshold: config.archive.quota_alert_threshold,
            progress,
            date: chrono::Local::now().date_naive(),
        }
    }
}

struct BucketOutcome {
    counters: RunCounters,
    error: Option<ArchiveError>,
}

/// Archives the buckets of one source
pub struct ArchiveOrchestrator {
    store: Arc<dyn ObjectStore>,
    options: ArchiveOptions,
    cancel: CancellationToken,
}

impl ArchiveOrchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, options: ArchiveOptions, cancel: CancellationToken) -> Self {
        Self {
            store,
            options,
            cancel,
        }
    }

    /// Archive every bucket of `source` that matches its bucket filter.
    ///
    /// A failing bucket is recorded in the report and does not stop the
    /// remaining buckets. Cancellation aborts the source after every open
    /// container has been closed.
    pub async fn run_source(&self, source: &SourceConfig) -> Result<SourceReport> {
        let start_time = Instant::now();
        let bucket_filter = NameFilter::full(&source.regexp_bucket)?;
        let object_filter = NameFilter::prefix(&source.regexp_object)?;

        info!(source = %source.name, "Archiving {}", source.name);

        let mut counters = RunCounters::default();
        let mut included = Vec::new();
        for bucket in self.store.list_buckets().await? {
            if bucket_filter.is_match(&bucket) {
                counters.buckets_included += 1;
                included.push(bucket);
            } else {
                counters.buckets_excluded += 1;
                debug!(bucket = %bucket, "Bucket excluded by filter");
            }
        }

        let object_filter = &object_filter;
        let outcomes: Vec<(String, BucketOutcome)> = stream::iter(included)
            .map(|bucket| async move {
                let outcome = self.archive_bucket(source, &bucket, object_filter).await;
                (bucket, outcome)
            })
            .buffer_unordered(self.options.max_concurrent_buckets.max(1))
            .collect()
            .await;

        let mut failed_buckets = Vec::new();
        let mut cancelled = false;
        for (bucket, outcome) in outcomes {
            counters.merge(&outcome.counters);
            match outcome.error {
                None => {}
                Some(ArchiveError::Cancelled) => cancelled = true,
                Some(e) => {
                    error!(source = %source.name, bucket = %bucket, error = %e, "Bucket archival failed");
                    failed_buckets.push(bucket);
                }
            }
        }
        if cancelled {
            warn!(source = %source.name, "Archival cancelled");
            return Err(ArchiveError::Cancelled);
        }
        failed_buckets.sort();
        counters.buckets_failed = failed_buckets.len();

        let report = SourceReport {
            name: source.name.clone(),
            quota_used: counters.bytes_observed as f64 / source.s3_quota as f64,
            counters,
            failed_buckets,
            elapsed_secs: start_time.elapsed().as_secs(),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    async fn archive_bucket(
        &self,
        source: &SourceConfig,
        bucket: &str,
        object_filter: &NameFilter,
    ) -> BucketOutcome {
        let packer = if self.options.packing {
            match ObjectPacker::open(
                &source.archive_path,
                bucket,
                Arc::clone(&self.store),
                source.object_size_min,
                self.options.date,
            ) {
                Ok(packer) => Some(Arc::new(packer)),
                Err(e) => {
                    return BucketOutcome {
                        counters: RunCounters::default(),
                        error: Some(e),
                    }
                }
            }
        } else {
            None
        };

        let mut counters = RunCounters::default();
        let mut error = self
            .drain_listing(source, bucket, object_filter, packer.as_ref(), &mut counters)
            .await
            .err();

        // Entries committed before a failure still reach the manifest.
        if let Some(packer) = packer {
            if let Err(e) = packer.close().await {
                match error {
                    None => error = Some(e),
                    Some(_) => warn!(bucket = %bucket, error = %e, "Failed to close container after error"),
                }
            }
        }

        if error.is_none() {
            info!(
                bucket = %bucket,
                archived = counters.objects_archived,
                archived_small = counters.objects_archived_small,
                transferred = counters.bytes_transferred,
                "Bucket archived"
            );
        }
        BucketOutcome { counters, error }
    }

    /// Page through `bucket` and route every matching object. Transfers of a
    /// page run concurrently; the first failure stops the listing after the
    /// page's in-flight transfers have settled.
    async fn drain_listing(
        &self,
        source: &SourceConfig,
        bucket: &str,
        object_filter: &NameFilter,
        packer: Option<&Arc<ObjectPacker>>,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency_budget.max(1) as usize));
        let mut tally = TransferTally::new(if self.options.progress { PROGRESS_INTERVAL } else { 0 });
        let mut continuation_token = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let page = self
                .store
                .list_objects(bucket, self.options.page_size, continuation_token.take())
                .await?;
            debug!(bucket = %bucket, objects = page.entries.len(), truncated = page.is_truncated, "Listed page");

            let mut handles = Vec::with_capacity(page.entries.len());
            for entry in page.entries {
                if !object_filter.is_match(&entry.key) {
                    counters.objects_excluded += 1;
                    continue;
                }
                counters.bytes_observed += entry.size;

                let route = match packer {
                    Some(_) if entry.size < source.object_size_min => Route::Packed,
                    _ => Route::Direct,
                };
                handles.push(self.spawn_transfer(
                    source,
                    bucket,
                    entry,
                    route,
                    packer.cloned(),
                    Arc::clone(&semaphore),
                ));
            }

            let mut first_error = None;
            for handle in handles {
                match handle.await {
                    Ok(Ok((route, bytes))) => {
                        counters.bytes_transferred += bytes;
                        match route {
                            Route::Direct => counters.objects_archived += 1,
                            Route::Packed => counters.objects_archived_small += 1,
                        }
                        if let Some(line) = tally.record(bytes) {
                            info!(bucket = %bucket, "{line}");
                        }
                    }
                    Ok(Err(e)) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        } else {
                            warn!(bucket = %bucket, error = %e, "Additional transfer failure");
                        }
                    }
                    Err(e) => {
                        warn!(bucket = %bucket, error = %e, "Transfer task panicked");
                        if first_error.is_none() {
                            first_error = Some(ArchiveError::Store(format!("transfer task failed: {e}")));
                        }
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            if !page.is_truncated {
                break;
            }
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => {
                    warn!(bucket = %bucket, "Listing truncated without a continuation token");
                    break;
                }
            }
        }

        if self.options.progress {
            info!(bucket = %bucket, "{}", tally.line());
        }
        Ok(())
    }

    fn spawn_transfer(
        &self,
        source: &SourceConfig,
        bucket: &str,
        entry: ObjectEntry,
        route: Route,
        packer: Option<Arc<ObjectPacker>>,
        semaphore: Arc<Semaphore>,
    ) -> JoinHandle<Result<(Route, u64)>> {
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let root = source.archive_path.clone();
        let bucket = bucket.to_string();
        let weight = concurrency_weight(entry.size, self.options.concurrency_budget);

        tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = semaphore.acquire_many_owned(weight) => {
                    permit.map_err(|e| ArchiveError::Store(format!("transfer semaphore closed: {e}")))?
                }
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            };
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            let bytes = match (route, packer) {
                (Route::Packed, Some(packer)) => packer.add_entry(&entry.key).await?,
                _ => download_if_absent(&root, &bucket, &entry.key, store.as_ref()).await?,
            };
            Ok((route, bytes))
        })
    }
}

async fn archive_source_file<F>(
    path: &Path,
    make_store: &F,
    options: &ArchiveOptions,
    cancel: &CancellationToken,
) -> Result<SourceReport>
where
    F: Fn(&SourceConfig) -> Result<Arc<dyn ObjectStore>>,
{
    let source = SourceConfig::from_file(path)?;
    let store = make_store(&source)?;
    ArchiveOrchestrator::new(store, options.clone(), cancel.clone())
        .run_source(&source)
        .await
}

/// Archive every source file in order, then check quotas.
///
/// Sources are independent: a source that fails is logged and the next one
/// still runs. Afterwards the first failure is returned; without failures,
/// sources above the quota threshold yield [`ArchiveError::QuotaExceeded`].
pub async fn archive_sources<F>(
    paths: &[PathBuf],
    make_store: F,
    options: &ArchiveOptions,
    cancel: &CancellationToken,
) -> Result<Vec<SourceReport>>
where
    F: Fn(&SourceConfig) -> Result<Arc<dyn ObjectStore>>,
{
    let mut reports = Vec::with_capacity(paths.len());
    let mut failure = None;

    for path in paths {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        match archive_source_file(path, &make_store, options, cancel).await {
            Ok(report) => {
                if !report.failed_buckets.is_empty() && failure.is_none() {
                    failure = Some(ArchiveError::BucketsFailed {
                        source_name: report.name.clone(),
                        buckets: report.failed_buckets.clone(),
                    });
                }
                reports.push(report);
            }
            Err(ArchiveError::Cancelled) => return Err(ArchiveError::Cancelled),
            Err(e) => {
                error!(config = %path.display(), error = %e, "Source archival failed");
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }

    let over_quota = quota_alerts(&reports, options.quota_alert_threshold);
    if !over_quota.is_empty() {
        warn!(sources = ?over_quota, threshold = options.quota_alert_threshold, "Sources close to their quota");
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if !over_quota.is_empty() {
        return Err(ArchiveError::QuotaExceeded { sources: over_quota });
    }
    Ok(reports)
}
