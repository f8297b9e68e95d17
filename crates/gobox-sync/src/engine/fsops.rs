//! Filesystem helpers shared by the replica and storage appliers.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::fs;
use uuid::Uuid;

use gobox_core::{normalize_timestamp, FileNode};

use crate::error::{SyncError, SyncResult};

/// Directory inside the sync root holding engine state (staging, trash).
/// Never synchronized.
pub const INTERNAL_DIR: &str = ".gobox";

/// Names of the root-relative path `path`, or `None` if it lies outside
/// `root` or inside the internal directory.
pub fn relative_segments(root: &Path, path: &Path) -> Option<Vec<String>> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segments.first().is_some_and(|first| first == INTERNAL_DIR) {
        return None;
    }
    Some(segments)
}

/// Absolute path of a node given its names below the root.
pub fn absolute(root: &Path, segments: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(segments);
    path
}

/// Root-relative key used by the path tracker.
pub fn key_of(segments: &[String]) -> PathBuf {
    segments.iter().collect()
}

pub fn to_timestamp(time: SystemTime) -> DateTime<Utc> {
    normalize_timestamp(DateTime::<Utc>::from(time))
}

pub async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

/// True if the file at `path` already has the node's size and mtime.
pub async fn matches_node(path: &Path, node: &FileNode) -> bool {
    match fs::metadata(path).await {
        Ok(meta) if node.is_directory => meta.is_dir(),
        Ok(meta) => {
            meta.is_file()
                && meta.len() == node.size
                && meta
                    .modified()
                    .map(|m| to_timestamp(m) == node.modified_at)
                    .unwrap_or(false)
        }
        Err(_) => false,
    }
}

/// Writes `bytes` to `target` through a staging file and a rename, then
/// stamps the modification time.
pub async fn write_atomic(
    staging_dir: &Path,
    target: &Path,
    bytes: &[u8],
    modified_at: DateTime<Utc>,
) -> SyncResult<()> {
    fs::create_dir_all(staging_dir).await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let staged = staging_dir.join(format!("{}.part", Uuid::new_v4()));
    fs::write(&staged, bytes).await?;
    set_modified(&staged, modified_at).await?;

    if let Err(e) = fs::rename(&staged, target).await {
        let _ = fs::remove_file(&staged).await;
        return Err(e.into());
    }
    Ok(())
}

/// Sets a file's modification time.
pub async fn set_modified(path: &Path, modified_at: DateTime<Utc>) -> SyncResult<()> {
    let path = path.to_path_buf();
    let time = SystemTime::from(modified_at);
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(time)
    })
    .await
    .map_err(|e| SyncError::Internal(e.to_string()))??;
    Ok(())
}

/// Removes a file or a whole directory. Missing paths are fine.
pub async fn remove_path(path: &Path) -> SyncResult<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Renames `from` to `to`, creating `to`'s parent. A missing source is
/// reported as `Ok(false)`.
pub async fn rename_path(from: &Path, to: &Path) -> SyncResult<bool> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gobox_core::timestamp_now;

    #[test]
    fn test_relative_segments() {
        let root = Path::new("/sync");
        assert_eq!(
            relative_segments(root, Path::new("/sync/docs/a.txt")),
            Some(vec!["docs".to_string(), "a.txt".to_string()])
        );
        assert_eq!(relative_segments(root, Path::new("/sync")), Some(vec![]));
        assert_eq!(relative_segments(root, Path::new("/elsewhere/a.txt")), None);
        assert_eq!(
            relative_segments(root, Path::new("/sync/.gobox/staging/x.part")),
            None
        );
    }

    #[test]
    fn test_absolute_and_key() {
        let segments = vec!["docs".to_string(), "a.txt".to_string()];
        assert_eq!(absolute(Path::new("/sync"), &segments), PathBuf::from("/sync/docs/a.txt"));
        assert_eq!(key_of(&segments), PathBuf::from("docs/a.txt"));
        assert_eq!(key_of(&[]), PathBuf::new());
    }

    #[tokio::test]
    async fn test_write_atomic_stamps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/notes.txt");
        let mtime = timestamp_now() - chrono::Duration::hours(1);

        write_atomic(&dir.path().join("staging"), &target, b"hello", mtime)
            .await
            .unwrap();

        assert_eq!(fs::read(&target).await.unwrap(), b"hello");
        let meta = fs::metadata(&target).await.unwrap();
        assert_eq!(to_timestamp(meta.modified().unwrap()), mtime);
    }

    #[tokio::test]
    async fn test_remove_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("nope")).await.unwrap();
        assert!(!rename_path(&dir.path().join("nope"), &dir.path().join("x")).await.unwrap());
    }
}
