//! Direct download of large objects into the archive tree.

use crate::store::ObjectStore;
use crate::utils::errors::{ArchiveError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Local path of `bucket/key` below `root`. Keys that would leave the bucket
/// directory are rejected.
pub fn local_object_path(root: &Path, bucket: &str, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    let safe = !key.is_empty()
        && !key.ends_with('/')
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe || bucket.is_empty() || bucket.contains(['/', '\\']) {
        return Err(ArchiveError::InvalidKey(format!("{bucket}/{key}")));
    }
    Ok(root.join(bucket).join(relative))
}

/// Download `bucket/key` to `<root>/<bucket>/<key>` unless it is already there.
///
/// Returns the bytes transferred, 0 when the file existed. The object is
/// written to a `temp_<name>~` sibling first and renamed into place, so an
/// interrupted run never leaves a partial file under the final name. Keys
/// ending in `/` are folder placeholders: their directory is created and
/// nothing is downloaded.
pub async fn download_if_absent(
    root: &Path,
    bucket: &str,
    key: &str,
    store: &dyn ObjectStore,
) -> Result<u64> {
    // Folder placeholders ("dir/") only materialize their directory.
    if key.ends_with('/') {
        let dir_key = key.trim_end_matches('/');
        if !dir_key.is_empty() {
            tokio::fs::create_dir_all(local_object_path(root, bucket, dir_key)?).await?;
        }
        debug!(bucket = %bucket, key = %key, "Directory marker");
        return Ok(0);
    }

    let target = local_object_path(root, bucket, key)?;
    if tokio::fs::try_exists(&target).await? {
        debug!(path = %target.display(), "Already archived");
        return Ok(0);
    }

    let file_name = target
        .file_name()
        .ok_or_else(|| ArchiveError::InvalidKey(format!("{bucket}/{key}")))?
        .to_string_lossy();
    let temp = target.with_file_name(format!("temp_{file_name}~"));

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Leftover from an interrupted run
    if tokio::fs::try_exists(&temp).await? {
        tokio::fs::remove_file(&temp).await?;
    }

    if let Err(e) = store.download_object(bucket, key, &temp).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    tokio::fs::rename(&temp, &target).await?;

    Ok(tokio::fs::metadata(&target).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_local_object_path_nests_key() {
        let path = local_object_path(Path::new("/srv/archive"), "logs", "2024/01/app.log").unwrap();
        assert_eq!(path, PathBuf::from("/srv/archive/logs/2024/01/app.log"));
    }

    #[test]
    fn test_local_object_path_rejects_escapes() {
        let root = Path::new("/srv/archive");
        assert!(local_object_path(root, "logs", "../etc/passwd").is_err());
        assert!(local_object_path(root, "logs", "a/../../b").is_err());
        assert!(local_object_path(root, "logs", "/etc/passwd").is_err());
        assert!(local_object_path(root, "logs", "dir/").is_err());
        assert!(local_object_path(root, "", "a").is_err());
    }

    #[tokio::test]
    async fn test_download_if_absent_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("media", "videos/big.bin", 4096);

        let first = download_if_absent(dir.path(), "media", "videos/big.bin", &store)
            .await
            .unwrap();
        assert_eq!(first, 4096);
        let target = dir.path().join("media/videos/big.bin");
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 4096);
        assert!(!dir.path().join("media/videos/temp_big.bin~").exists());

        let second = download_if_absent(dir.path(), "media", "videos/big.bin", &store)
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.downloads(), 1);
    }

    #[tokio::test]
    async fn test_download_replaces_leftover_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("media", "clip.bin", 2000);

        let bucket_dir = dir.path().join("media");
        std::fs::create_dir_all(&bucket_dir).unwrap();
        std::fs::write(bucket_dir.join("temp_clip.bin~"), b"partial").unwrap();

        let bytes = download_if_absent(dir.path(), "media", "clip.bin", &store).await.unwrap();
        assert_eq!(bytes, 2000);
        assert!(!bucket_dir.join("temp_clip.bin~").exists());
    }

    #[tokio::test]
    async fn test_folder_marker_creates_directory_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("media", "videos/", 0);
        store.put("media", "/", 0);

        let bytes = download_if_absent(dir.path(), "media", "videos/", &store).await.unwrap();
        assert_eq!(bytes, 0);
        assert!(dir.path().join("media/videos").is_dir());
        assert_eq!(download_if_absent(dir.path(), "media", "/", &store).await.unwrap(), 0);
        assert_eq!(store.downloads(), 0);

        // A later object below the placeholder still lands in the directory.
        store.put("media", "videos/clip.bin", 100);
        let bytes = download_if_absent(dir.path(), "media", "videos/clip.bin", &store)
            .await
            .unwrap();
        assert_eq!(bytes, 100);
    }

    #[tokio::test]
    async fn test_folder_marker_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let result = download_if_absent(dir.path(), "media", "../outside/", &store).await;
        assert!(matches!(result, Err(ArchiveError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("media", "clip.bin", 2000);
        store.fail_on("media", "clip.bin");

        let result = download_if_absent(dir.path(), "media", "clip.bin", &store).await;
        assert!(matches!(result, Err(ArchiveError::Store(_))));
        assert!(!dir.path().join("media/clip.bin").exists());
        assert!(!dir.path().join("media/temp_clip.bin~").exists());
    }
}
