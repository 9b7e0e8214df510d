//! Transfer accounting and formatting helpers.

pub mod progress;
