//! Manifest files recording which objects already live in a container.
//!
//! Each container `small_objects_<bucket>_<date>.zip` has a sibling
//! `small_objects_<bucket>_<date>.txt` listing one qualified name
//! (`bucket/key`) per line. Manifests are never deleted, so the union of all of
//! them is the bucket's archive history.

use crate::utils::errors::Result;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;

pub const FILE_PREFIX: &str = "small_objects_";
pub const MANIFEST_EXTENSION: &str = "txt";
pub const CONTAINER_EXTENSION: &str = "zip";

/// File stem shared by a bucket's container and manifest for one day.
pub fn file_stem(bucket: &str, date: NaiveDate) -> String {
    format!("{FILE_PREFIX}{bucket}_{}", date.format("%Y-%m-%d"))
}

/// Qualified name of an object inside containers and manifests.
pub fn qualified_name(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

/// Load every manifest in `dir`. A missing directory is an empty history.
pub fn load_history(dir: &Path) -> Result<HashSet<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };

    let mut history = HashSet::new();
    for entry in entries {
        let path = entry?.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_PREFIX))
            && path.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION);
        if !is_manifest {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        history.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }

    Ok(history)
}

/// Replace the manifest at `path` with `names`, newline-joined.
pub fn write_manifest(path: &Path, names: &[String]) -> Result<()> {
    // Written next to the target and renamed so a crash never truncates history.
    let tmp = path.with_extension(format!("{MANIFEST_EXTENSION}.tmp"));
    std::fs::write(&tmp, names.join("\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_uses_iso_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(file_stem("logs", date), "small_objects_logs_2024-03-07");
    }

    #[test]
    fn test_load_history_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let history = load_history(&dir.path().join("nope")).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_load_history_unions_all_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("small_objects_logs_2024-01-01.txt"),
            "logs/a\nlogs/b\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("small_objects_logs_2024-01-02.txt"),
            "logs/b\n  logs/c  \n\n",
        )
        .unwrap();
        // Not manifests
        std::fs::write(dir.path().join("small_objects_logs_2024-01-02.zip"), "PK").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "logs/z").unwrap();
        std::fs::write(dir.path().join("small_objects_logs_2024-01-03.txt.tmp"), "logs/y").unwrap();

        let history = load_history(dir.path()).unwrap();
        let mut names: Vec<_> = history.into_iter().collect();
        names.sort();
        assert_eq!(names, vec!["logs/a", "logs/b", "logs/c"]);
    }

    #[test]
    fn test_write_manifest_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small_objects_logs_2024-01-01.txt");
        write_manifest(&path, &["logs/a".to_string()]).unwrap();
        write_manifest(&path, &["logs/a".to_string(), "logs/b".to_string()]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "logs/a\nlogs/b");
        assert!(!path.with_extension("txt.tmp").exists());
    }
}
