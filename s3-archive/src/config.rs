//! Configuration management for the archive job.
//!
//! Runtime settings come from an optional TOML file. Every archival target
//! (a "source") is described by its own flat `key=value` file in the
//! configuration directory.

use crate::utils::errors::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Directory holding one `*.conf` file per source
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Pack objects below `object_size_min` into containers. When disabled,
    /// every matching object is downloaded as an individual file.
    #[serde(default = "default_packing")]
    pub packing: bool,

    /// Fraction of a source's quota above which the run reports an overage
    #[serde(default = "default_quota_alert_threshold")]
    pub quota_alert_threshold: f64,

    /// Keys requested per listing call
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Marker file location
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,

    /// Age after which a marker is considered abandoned (if no instance is alive)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Substring identifying competing instances in the process table
    #[serde(default = "default_process_identity")]
    pub process_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output (stdout, stderr)
    #[serde(default = "default_log_output")]
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Buckets of one source processed at the same time
    #[serde(default = "default_max_concurrent_buckets")]
    pub max_concurrent_buckets: usize,

    /// Permit budget shared by the object transfers of one bucket
    #[serde(default = "default_concurrency_budget")]
    pub concurrency_budget: u32,
}

// Default values
fn default_conf_dir() -> PathBuf {
    PathBuf::from("conf.d")
}

fn default_packing() -> bool {
    true
}

fn default_quota_alert_threshold() -> f64 {
    0.95
}

fn default_page_size() -> usize {
    500
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("s3-archive.lock")
}

fn default_stale_after_secs() -> u64 {
    2 * 60 * 60
}

fn default_process_identity() -> String {
    "s3-archive".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_concurrent_buckets() -> usize {
    1
}

fn default_concurrency_budget() -> u32 {
    8
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            conf_dir: default_conf_dir(),
            packing: default_packing(),
            quota_alert_threshold: default_quota_alert_threshold(),
            page_size: default_page_size(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            stale_after_secs: default_stale_after_secs(),
            process_identity: default_process_identity(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_buckets: default_max_concurrent_buckets(),
            concurrency_budget: default_concurrency_budget(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.archive.page_size == 0 || self.archive.page_size > 1000 {
            return Err(ArchiveError::Config(format!(
                "archive.page_size must be between 1 and 1000, got {}",
                self.archive.page_size
            )));
        }
        if self.performance.max_concurrent_buckets == 0 {
            return Err(ArchiveError::Config(
                "performance.max_concurrent_buckets must be at least 1".to_string(),
            ));
        }
        if self.performance.concurrency_budget == 0 {
            return Err(ArchiveError::Config(
                "performance.concurrency_budget must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One archival target, read from a `key=value` file.
#[derive(Clone)]
pub struct SourceConfig {
    pub name: String,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_endpoint_url: String,
    pub s3_region: String,
    pub regexp_bucket: String,
    pub regexp_object: String,
    /// Objects smaller than this are packed; also the container size floor
    pub object_size_min: u64,
    /// Storage quota in bytes
    pub s3_quota: u64,
    pub archive_path: PathBuf,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("s3_endpoint_url", &self.s3_endpoint_url)
            .field("s3_region", &self.s3_region)
            .field("regexp_bucket", &self.regexp_bucket)
            .field("regexp_object", &self.regexp_object)
            .field("object_size_min", &self.object_size_min)
            .field("s3_quota", &self.s3_quota)
            .field("archive_path", &self.archive_path)
            .finish_non_exhaustive()
    }
}

impl SourceConfig {
    /// Read and validate a source file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_map(parse_key_values(&content)).map_err(|e| match e {
            ArchiveError::Config(msg) => {
                ArchiveError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_map(mut map: HashMap<String, String>) -> Result<Self> {
        let mut take = |key: &str| {
            map.remove(key)
                .ok_or_else(|| ArchiveError::Config(format!("missing required key '{key}'")))
        };

        let name = take("name")?;
        let s3_access_key_id = take("s3_access_key_id")?;
        let s3_secret_access_key = take("s3_secret_access_key")?;
        let s3_endpoint_url = take("s3_endpoint_url")?;
        let regexp_bucket = take("regexp_bucket")?;
        let regexp_object = take("regexp_object")?;
        let object_size_min = parse_bytes("object_size_min", &take("object_size_min")?)?;
        let s3_quota = parse_bytes("s3_quota", &take("s3_quota")?)?;
        let archive_path = PathBuf::from(take("archive_path")?);
        let s3_region = take("s3_region").unwrap_or_else(|_| "us-east-1".to_string());

        if s3_quota == 0 {
            return Err(ArchiveError::Config("s3_quota must be greater than zero".to_string()));
        }

        Ok(Self {
            name,
            s3_access_key_id,
            s3_secret_access_key,
            s3_endpoint_url,
            s3_region,
            regexp_bucket,
            regexp_object,
            object_size_min,
            s3_quota,
            archive_path,
        })
    }
}

fn parse_bytes(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| ArchiveError::Config(format!("'{key}' must be an integer byte count, got '{value}'")))
}

/// Parse a flat `key=value` file. Blank lines and `#` comments are skipped,
/// the first `=` separates key from value and both sides are trimmed.
pub fn parse_key_values(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// All `*.conf` files in `dir`, sorted by file name.
pub fn source_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# archive of the lab storage
name = lab
s3_access_key_id = AKIA123
s3_secret_access_key = se=cret
s3_endpoint_url = https://s3.example.org

regexp_bucket = logs-.*
regexp_object = .*
object_size_min = 1024
s3_quota = 1000000
archive_path = /srv/archive
";

    #[test]
    fn test_parse_key_values_skips_comments_and_splits_once() {
        let map = parse_key_values(SAMPLE);
        assert_eq!(map.get("name").map(String::as_str), Some("lab"));
        assert_eq!(map.get("s3_secret_access_key").map(String::as_str), Some("se=cret"));
        assert!(!map.keys().any(|k| k.starts_with('#')));
    }

    #[test]
    fn test_source_config_from_map() {
        let source = SourceConfig::from_map(parse_key_values(SAMPLE)).unwrap();
        assert_eq!(source.name, "lab");
        assert_eq!(source.object_size_min, 1024);
        assert_eq!(source.s3_quota, 1_000_000);
        assert_eq!(source.s3_region, "us-east-1");
        assert_eq!(source.archive_path, PathBuf::from("/srv/archive"));
    }

    #[test]
    fn test_source_config_missing_key() {
        let mut map = parse_key_values(SAMPLE);
        map.remove("regexp_object");
        let err = SourceConfig::from_map(map).unwrap_err();
        assert!(err.to_string().contains("regexp_object"));
    }

    #[test]
    fn test_source_config_rejects_bad_numbers() {
        let mut map = parse_key_values(SAMPLE);
        map.insert("object_size_min".to_string(), "1k".to_string());
        assert!(matches!(SourceConfig::from_map(map), Err(ArchiveError::Config(_))));

        let mut map = parse_key_values(SAMPLE);
        map.insert("s3_quota".to_string(), "0".to_string());
        assert!(matches!(SourceConfig::from_map(map), Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let source = SourceConfig::from_map(parse_key_values(SAMPLE)).unwrap();
        let rendered = format!("{:?}", source);
        assert!(!rendered.contains("se=cret"));
        assert!(!rendered.contains("AKIA123"));
    }

    #[test]
    fn test_source_files_sorted_conf_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.conf"), "").unwrap();
        std::fs::write(dir.path().join("a.conf"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = source_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.conf", "b.conf"]);
    }

    #[test]
    fn test_runtime_config_defaults_from_partial_toml() {
        let config: Config = toml::from_str("[lock]\nstale_after_secs = 60\n").unwrap();
        assert_eq!(config.lock.stale_after_secs, 60);
        assert_eq!(config.lock.process_identity, "s3-archive");
        assert_eq!(config.archive.page_size, 500);
        assert!(config.archive.packing);
        assert_eq!(config.performance.max_concurrent_buckets, 1);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_runtime_config_rejects_oversized_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.toml");
        std::fs::write(&path, "[archive]\npage_size = 5000\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
