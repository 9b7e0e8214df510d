//! Single-instance guard backed by a marker file.
//!
//! The marker's modification time is its creation timestamp. A marker older
//! than the staleness window is only reclaimed when no competing process is
//! found, so a crashed run heals itself while a slow run is left alone.
//! The guard is host-local; it does not protect a destination shared between
//! hosts.

pub mod liveness;

use crate::config::LockConfig;
use crate::utils::errors::Result;
use liveness::{LivenessChecker, ProcessTable};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub struct InstanceLock {
    path: PathBuf,
    stale_after: Duration,
    identity: String,
    liveness: Box<dyn LivenessChecker>,
}

/// Removes the marker when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl InstanceLock {
    /// Lock described by the `[lock]` section, probing the real process table.
    pub fn new(config: &LockConfig) -> Self {
        Self::with_liveness(
            config.path.clone(),
            Duration::from_secs(config.stale_after_secs),
            config.process_identity.clone(),
            Box::new(ProcessTable),
        )
    }

    pub fn with_liveness(
        path: PathBuf,
        stale_after: Duration,
        identity: String,
        liveness: Box<dyn LivenessChecker>,
    ) -> Self {
        Self {
            path,
            stale_after,
            identity,
            liveness,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to become the running instance.
    ///
    /// Returns `Some(guard)` when the marker was created (or a stale,
    /// unowned one reclaimed) and `None` when the caller must abort.
    pub fn acquire(&self) -> Result<Option<LockGuard>> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                // A timestamp in the future counts as fresh.
                let age = meta.modified()?.elapsed().unwrap_or_default();
                if age <= self.stale_after {
                    info!(path = %self.path.display(), age_secs = age.as_secs(), "Lock file exists, exiting");
                    return Ok(None);
                }
                if self.liveness.other_instance_alive(&self.identity)? {
                    warn!(
                        path = %self.path.display(),
                        age_secs = age.as_secs(),
                        "Stale lock file but another instance is still running, exiting"
                    );
                    return Ok(None);
                }
                warn!(path = %self.path.display(), age_secs = age.as_secs(), "Reclaiming stale lock file");
                self.write_marker(false)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                match self.write_marker(true) {
                    Ok(()) => {}
                    // Lost the race against an instance starting at the same moment.
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(LockGuard {
            path: self.path.clone(),
        }))
    }

    fn write_marker(&self, create_new: bool) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true);
        if create_new {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let mut file = options.open(&self.path)?;
        writeln!(file, "{}", std::process::id())?;
        file.set_modified(std::time::SystemTime::now())?;
        file.sync_all()
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Released lock file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}
