//! Consolidation of small objects into one uncompressed container per bucket
//! and day.
//!
//! An object is fetched at most once over the lifetime of the archive: the
//! manifests of earlier runs are checked first, then the listing of the
//! container currently open, and only then is the object downloaded.

use super::manifest::{self, qualified_name, CONTAINER_EXTENSION, MANIFEST_EXTENSION};
use crate::store::ObjectStore;
use crate::utils::errors::{ArchiveError, Result};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the filler entry that lifts a container to the size floor.
/// Object entries always contain a `/`, padding entries never do.
const PADDING_NAME: &str = ".padding";

fn is_padding(name: &str) -> bool {
    name.starts_with(PADDING_NAME) && !name.contains('/')
}

fn stored_options(large_file: bool) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(large_file)
}

/// Outcome of [`ObjectPacker::close`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    /// Object entries recorded in the manifest
    pub entries: usize,
    /// Finalized container size, `None` when the empty container was removed
    pub container_size: Option<u64>,
    /// Bytes of padding appended
    pub padding: u64,
    /// The container stayed below the floor despite padding
    pub under_floor: bool,
}

struct ContainerState {
    writer: Option<ZipWriter<File>>,
    /// Entry names in write order, including entries from earlier runs today
    entries: Vec<String>,
    names: HashSet<String>,
    scratch: Option<TempDir>,
    report: Option<CloseReport>,
}

impl ContainerState {
    /// Append `source` under `name`. Returns false when the name is taken.
    fn append_file(&mut self, name: &str, source: &Path) -> Result<bool> {
        if self.names.contains(name) {
            return Ok(false);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ArchiveError::PackerClosed(name.to_string()))?;

        let mut file = File::open(source)?;
        writer.start_file(name, stored_options(false))?;
        if let Err(e) = std::io::copy(&mut file, &mut *writer) {
            // Drop the half-written entry so the listing only holds committed objects.
            writer.abort_file()?;
            return Err(e.into());
        }

        self.names.insert(name.to_string());
        self.entries.push(name.to_string());
        Ok(true)
    }

    fn next_padding_name(&self) -> String {
        let existing = self.entries.iter().filter(|n| is_padding(n)).count();
        if existing == 0 {
            PADDING_NAME.to_string()
        } else {
            format!("{PADDING_NAME}-{existing}")
        }
    }
}

pub struct ObjectPacker {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    min_file_size: u64,
    container_path: PathBuf,
    manifest_path: PathBuf,
    /// Snapshot of every manifest on disk when the packer was opened
    history: HashSet<String>,
    scratch_dir: PathBuf,
    next_scratch: AtomicU64,
    /// Owned guards of this lock are moved onto the blocking pool for writes
    state: Arc<Mutex<ContainerState>>,
}

impl ObjectPacker {
    /// Open (or create) the container of `bucket` for `date` below
    /// `<archive_root>/<bucket>/small_objects/` and load the bucket's history.
    pub fn open(
        archive_root: &Path,
        bucket: &str,
        store: Arc<dyn ObjectStore>,
        min_file_size: u64,
        date: NaiveDate,
    ) -> Result<Self> {
        let dir = archive_root.join(bucket).join("small_objects");
        std::fs::create_dir_all(&dir)?;

        let stem = manifest::file_stem(bucket, date);
        let container_path = dir.join(format!("{stem}.{CONTAINER_EXTENSION}"));
        let manifest_path = dir.join(format!("{stem}.{MANIFEST_EXTENSION}"));

        let history = manifest::load_history(&dir)?;
        let (writer, entries) = open_container(&container_path, &manifest_path)?;
        let scratch = tempfile::Builder::new().prefix("s3-archive-").tempdir()?;

        info!(
            bucket = %bucket,
            container = %container_path.display(),
            history = history.len(),
            existing_entries = entries.len(),
            "Opened small-object container"
        );

        Ok(Self {
            bucket: bucket.to_string(),
            store,
            min_file_size,
            container_path,
            manifest_path,
            history,
            scratch_dir: scratch.path().to_path_buf(),
            next_scratch: AtomicU64::new(0),
            state: Arc::new(Mutex::new(ContainerState {
                writer: Some(writer),
                names: entries.iter().cloned().collect(),
                entries,
                scratch: Some(scratch),
                report: None,
            })),
        })
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Archive `key` into the container unless it was archived before.
    ///
    /// Returns the number of bytes downloaded, 0 when the object was skipped.
    /// Concurrent calls download in parallel; appends are serialized.
    pub async fn add_entry(&self, key: &str) -> Result<u64> {
        let name = qualified_name(&self.bucket, key);
        if self.history.contains(&name) {
            return Ok(0);
        }
        {
            let state = self.state.lock().await;
            if state.writer.is_none() {
                return Err(ArchiveError::PackerClosed(self.container_path.display().to_string()));
            }
            if state.names.contains(&name) {
                return Ok(0);
            }
        }

        let scratch = self
            .scratch_dir
            .join(format!("object-{:08}", self.next_scratch.fetch_add(1, Ordering::Relaxed)));
        let bytes = match self.store.download_object(&self.bucket, key, &scratch).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                return Err(e);
            }
        };

        let mut state = Arc::clone(&self.state).lock_owned().await;
        let entry_name = name.clone();
        let appended = tokio::task::spawn_blocking(move || {
            let appended = state.append_file(&entry_name, &scratch);
            let _ = std::fs::remove_file(&scratch);
            appended
        })
        .await
        .map_err(blocking_task_error)??;

        if !appended {
            debug!(name = %name, "Entry appeared in container while downloading");
            return Ok(0);
        }
        debug!(name = %name, bytes, "Packed object");
        Ok(bytes)
    }

    /// Finalize the container: write its manifest, pad it to the size floor
    /// and release the scratch directory. A container without entries is
    /// deleted instead. Calling `close` again returns the first report.
    pub async fn close(&self) -> Result<CloseReport> {
        let mut state = Arc::clone(&self.state).lock_owned().await;
        if let Some(report) = &state.report {
            return Ok(report.clone());
        }

        let target = CloseTarget {
            bucket: self.bucket.clone(),
            container_path: self.container_path.clone(),
            manifest_path: self.manifest_path.clone(),
            min_file_size: self.min_file_size,
        };
        tokio::task::spawn_blocking(move || target.finalize(&mut state))
            .await
            .map_err(blocking_task_error)?
    }
}

fn blocking_task_error(e: tokio::task::JoinError) -> ArchiveError {
    ArchiveError::Io(std::io::Error::other(format!("container task failed: {e}")))
}

/// Everything `close` needs on the blocking pool
struct CloseTarget {
    bucket: String,
    container_path: PathBuf,
    manifest_path: PathBuf,
    min_file_size: u64,
}

impl CloseTarget {
    fn finalize(&self, state: &mut ContainerState) -> Result<CloseReport> {
        let mut writer = state
            .writer
            .take()
            .ok_or_else(|| ArchiveError::PackerClosed(self.container_path.display().to_string()))?;

        let report = if state.entries.is_empty() {
            writer.finish()?;
            std::fs::remove_file(&self.container_path)?;
            debug!(container = %self.container_path.display(), "Removed empty container");
            CloseReport {
                entries: 0,
                container_size: None,
                padding: 0,
                under_floor: false,
            }
        } else {
            let objects: Vec<String> = state
                .entries
                .iter()
                .filter(|n| !is_padding(n))
                .cloned()
                .collect();
            manifest::write_manifest(&self.manifest_path, &objects)?;

            let current = std::fs::metadata(&self.container_path)?.len();
            let padding = self.min_file_size.saturating_sub(current);
            if padding > 0 {
                let name = state.next_padding_name();
                writer.start_file(name.as_str(), stored_options(padding >= u64::from(u32::MAX)))?;
                std::io::copy(&mut std::io::repeat(0).take(padding), &mut writer)?;
                state.entries.push(name);
            }
            writer.finish()?;

            let size = std::fs::metadata(&self.container_path)?.len();
            let under_floor = size < self.min_file_size;
            if under_floor {
                warn!(
                    container = %self.container_path.display(),
                    size,
                    min_file_size = self.min_file_size,
                    "Container is smaller than the minimum file size after padding"
                );
            }

            info!(
                bucket = %self.bucket,
                entries = objects.len(),
                size,
                padding,
                "Closed small-object container"
            );
            CloseReport {
                entries: objects.len(),
                container_size: Some(size),
                padding,
                under_floor,
            }
        };

        if let Some(scratch) = state.scratch.take() {
            if let Err(e) = scratch.close() {
                warn!(error = %e, "Failed to remove scratch directory");
            }
        }
        state.report = Some(report.clone());
        Ok(report)
    }
}

/// Open a container for append and return its current entry names.
///
/// A file that is not a readable archive (e.g. a run killed mid-write) is
/// moved aside. The manifest written for it is renamed alongside and keeps
/// counting as history, so the next close cannot drop its names.
fn open_container(path: &Path, manifest_path: &Path) -> Result<(ZipWriter<File>, Vec<String>)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok((ZipWriter::new(file), Vec::new()));
    }

    let listing = ZipArchive::new(&file)
        .map(|archive| archive.file_names().map(str::to_string).collect::<Vec<_>>());
    let names = match listing {
        Ok(names) => names,
        Err(ZipError::InvalidArchive(reason)) => {
            drop(file);
            let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S").to_string();
            let aside = PathBuf::from(format!("{}.corrupt-{stamp}", path.display()));
            warn!(
                container = %path.display(),
                moved_to = %aside.display(),
                reason = %reason,
                "Unreadable container moved aside"
            );
            std::fs::rename(path, &aside)?;
            if manifest_path.exists() {
                let kept = manifest_path.with_extension(format!("corrupt-{stamp}.{MANIFEST_EXTENSION}"));
                std::fs::rename(manifest_path, &kept)?;
            }
            return open_container(path, manifest_path);
        }
        Err(e) => return Err(e.into()),
    };

    Ok((ZipWriter::new_append(file)?, names))
}
