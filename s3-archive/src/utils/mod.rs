//! Utility modules for the archive job.

pub mod errors;
pub mod logger;

pub use errors::{ArchiveError, Result};
