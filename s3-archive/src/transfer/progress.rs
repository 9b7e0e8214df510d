//! Running tally of archived objects for periodic progress output.

/// Counts archived objects and transferred bytes, reporting every
/// `interval` objects.
#[derive(Debug, Clone)]
pub struct TransferTally {
    files: usize,
    bytes: u64,
    interval: usize,
}

impl TransferTally {
    /// Create a tally reporting every `interval` objects (0 disables reports)
    pub fn new(interval: usize) -> Self {
        Self {
            files: 0,
            bytes: 0,
            interval,
        }
    }

    /// Record one archived object. Returns a progress line when the object
    /// count crosses the next interval.
    pub fn record(&mut self, bytes: u64) -> Option<String> {
        self.files += 1;
        self.bytes += bytes;
        if self.interval > 0 && self.files % self.interval == 0 {
            Some(self.line())
        } else {
            None
        }
    }

    /// Current progress line
    pub fn line(&self) -> String {
        format!("Fetched: {} files, {}", self.files, format_bytes(self.bytes))
    }

    pub fn files(&self) -> usize {
        self.files
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
