//! Detection of competing job instances in the process table.

use crate::utils::errors::Result;

/// Answers whether another process of this job is currently running.
pub trait LivenessChecker: Send + Sync {
    fn other_instance_alive(&self, identity: &str) -> Result<bool>;
}

/// Scans `/proc/<pid>/cmdline` for processes whose command line contains the
/// job identity. The current process is never counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTable;

impl LivenessChecker for ProcessTable {
    #[cfg(target_os = "linux")]
    fn other_instance_alive(&self, identity: &str) -> Result<bool> {
        let own_pid = std::process::id();

        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            // Processes can exit between read_dir and read; treat as not matching.
            let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            if cmdline_matches(&raw, identity) {
                tracing::debug!(pid, identity, "Found competing instance");
                return Ok(true);
            }
        }

        Ok(false)
    }

    #[cfg(not(target_os = "linux"))]
    fn other_instance_alive(&self, _identity: &str) -> Result<bool> {
        Ok(false)
    }
}

/// `cmdline` is NUL-separated; arguments are concatenated before matching.
fn cmdline_matches(raw: &[u8], identity: &str) -> bool {
    !identity.is_empty() && joined_cmdline(raw).contains(identity)
}

fn joined_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0).map(String::from_utf8_lossy).collect()
}
