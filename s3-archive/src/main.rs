//! S3 Archive - Main entry point
//!
//! Mirrors every configured source once and exits. Intended to be started
//! by cron or a systemd timer.

use anyhow::{Context, Result};
use clap::Parser;
use s3_archive::config::{self, Config};
use s3_archive::daemon::shutdown::ShutdownCoordinator;
use s3_archive::executor::{archive_sources, ArchiveOptions};
use s3_archive::lock::InstanceLock;
use s3_archive::store::{ObjectStore, S3Store};
use s3_archive::{utils, ArchiveError, SourceConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to runtime configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory of source `*.conf` files (overrides config)
    #[arg(short = 'd', long, value_name = "DIR")]
    conf_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Report mode: only print the per-source summaries
    #[arg(short, long)]
    report: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The lock guard lives inside `run`, so it is released before exiting.
    let code = run(args).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(args: Args) -> Result<i32> {
    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.conf_dir {
        config.archive.conf_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    // Initialize logging
    utils::logger::init(&config.log)?;

    tracing::info!("Starting s3-archive v{}", env!("CARGO_PKG_VERSION"));

    let lock = InstanceLock::new(&config.lock);
    let Some(_guard) = lock.acquire()? else {
        let err = ArchiveError::LockHeld(lock.path().display().to_string());
        tracing::error!("{}", err);
        return Ok(err.exit_code());
    };

    let paths = config::source_files(&config.archive.conf_dir).with_context(|| {
        format!(
            "failed to read source configurations from {}",
            config.archive.conf_dir.display()
        )
    })?;
    if paths.is_empty() {
        tracing::warn!(dir = %config.archive.conf_dir.display(), "No source configurations found");
    }

    let options = ArchiveOptions::from_config(&config, !args.report);
    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();

    let make_store = |source: &SourceConfig| -> s3_archive::Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Store::from_source(source)))
    };
    let archive = archive_sources(&paths, make_store, &options, &cancel);
    tokio::pin!(archive);

    // A signal cancels the run; the archive future then winds down and
    // closes every open container before returning.
    let result = tokio::select! {
        result = &mut archive => result,
        _ = shutdown.wait_for_signal() => archive.await,
    };

    match result {
        Ok(reports) => {
            tracing::info!(sources = reports.len(), "Archive run complete");
            Ok(0)
        }
        Err(e) => {
            tracing::error!("{}", e);
            Ok(e.exit_code())
        }
    }
}
