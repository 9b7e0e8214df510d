//! Regex inclusion filters for bucket names and object keys.

use crate::utils::errors::Result;
use regex::Regex;

/// Compiled inclusion pattern.
#[derive(Debug, Clone)]
pub struct NameFilter {
    regex: Regex,
}

impl NameFilter {
    /// The whole name must match.
    pub fn full(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }

    /// The pattern must match at the start of the name.
    pub fn prefix(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(&format!("^(?:{pattern})"))?,
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_requires_whole_name() {
        let filter = NameFilter::full("logs-[0-9]+").unwrap();
        assert!(filter.is_match("logs-2024"));
        assert!(!filter.is_match("logs-2024-old"));
        assert!(!filter.is_match("old-logs-2024"));
    }

    #[test]
    fn test_alternation_is_grouped() {
        let filter = NameFilter::full("a|b").unwrap();
        assert!(filter.is_match("a"));
        assert!(!filter.is_match("ab"));
    }

    #[test]
    fn test_prefix_match_anchors_at_start() {
        let filter = NameFilter::prefix("raw/").unwrap();
        assert!(filter.is_match("raw/2024/file.bin"));
        assert!(!filter.is_match("cooked/raw/file.bin"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(NameFilter::full("(unclosed").is_err());
    }
}
