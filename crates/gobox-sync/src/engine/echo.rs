//! Echo suppression.
//!
//! After the engine changes a path itself it records what the path looks
//! like on disk (absent, a directory, or a file of a given length and
//! mtime). A watcher notification for that path is our own echo only while
//! the disk still shows exactly that footprint; anything else is a real
//! edit and goes through planning like any other change.
//!
//! Marks older than the window are forgotten. Forgetting one never loses a
//! change: planning compares against the mirror and finds nothing to do for
//! a stale echo.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::time::Instant;

/// What a path looked like right after the engine wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Footprint {
    Absent,
    Directory,
    File {
        len: u64,
        modified: Option<SystemTime>,
    },
}

impl Footprint {
    pub async fn of(path: &Path) -> Footprint {
        match fs::symlink_metadata(path).await {
            Err(_) => Footprint::Absent,
            Ok(meta) if meta.is_dir() => Footprint::Directory,
            Ok(meta) => Footprint::File {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
        }
    }
}

#[derive(Debug)]
struct Mark {
    footprint: Footprint,
    at: Instant,
}

#[derive(Debug)]
pub struct EchoGuard {
    window: Duration,
    marks: Mutex<HashMap<PathBuf, Mark>>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        EchoGuard {
            window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn marks(&self) -> MutexGuard<'_, HashMap<PathBuf, Mark>> {
        self.marks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records the current footprint of `path`, which the engine has just
    /// written, renamed or removed.
    pub async fn record(&self, path: &Path) {
        let footprint = Footprint::of(path).await;
        let now = Instant::now();
        let mut marks = self.marks();
        marks.retain(|_, mark| now.duration_since(mark.at) < self.window);
        marks.insert(path.to_path_buf(), Mark { footprint, at: now });
    }

    /// True if `path` still looks exactly as the engine left it.
    ///
    /// A matching mark is kept (one write commonly yields several
    /// notifications); a mismatching one is dropped, since the path has
    /// been changed by someone else since.
    pub async fn is_echo(&self, path: &Path) -> bool {
        let expected = match self.marks().get(path) {
            Some(mark) if mark.at.elapsed() < self.window => mark.footprint.clone(),
            _ => return false,
        };
        if Footprint::of(path).await == expected {
            return true;
        }
        self.marks().remove(path);
        false
    }

    pub fn len(&self) -> usize {
        self.marks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EchoGuard {
    fn default() -> Self {
        EchoGuard::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_untouched_write_is_an_echo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let guard = EchoGuard::default();

        assert!(!guard.is_echo(&path).await);
        fs::write(&path, b"remote").await.unwrap();
        guard.record(&path).await;

        assert!(guard.is_echo(&path).await);
        assert!(guard.is_echo(&path).await);
        assert!(!guard.is_echo(&dir.path().join("other.txt")).await);
    }

    #[tokio::test]
    async fn test_edit_after_write_is_not_an_echo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let guard = EchoGuard::default();

        fs::write(&path, b"remote").await.unwrap();
        guard.record(&path).await;
        fs::write(&path, b"user edited this file").await.unwrap();

        assert!(!guard.is_echo(&path).await);
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn test_removal_and_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        let guard = EchoGuard::default();

        guard.record(&path).await;
        assert!(guard.is_echo(&path).await);

        fs::write(&path, b"back again").await.unwrap();
        assert!(!guard.is_echo(&path).await);
    }

    #[tokio::test]
    async fn test_marks_expire_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs");
        fs::create_dir(&path).await.unwrap();
        let guard = EchoGuard::new(Duration::from_millis(50));

        guard.record(&path).await;
        assert!(guard.is_echo(&path).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!guard.is_echo(&path).await);

        guard.record(&dir.path().join("fresh")).await;
        assert_eq!(guard.len(), 1);
    }
}
