//! # Filesystem Watcher
//!
//! Recursive `notify` watcher on the sync root feeding the engine.
//!
//! ```text
//! notify thread ──Event──► changes_for() ──LocalChange──► EngineHandle
//!                                                          (per-path queue,
//!                                                           then echo check)
//! ```
//!
//! Notification kinds only pick the paths to look at; the engine decides
//! what happened from the filesystem state. Anything under the internal
//! `.gobox` directory is ignored.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::engine::fsops::relative_segments;
use crate::engine::{EngineHandle, LocalChange};
use crate::error::SyncResult;

/// Maps one notification to local changes. Paths outside `root` or inside
/// the internal directory are dropped.
pub fn changes_for(root: &Path, event: &Event) -> Vec<LocalChange> {
    let synced = |path: &PathBuf| {
        relative_segments(root, path).is_some_and(|segments| !segments.is_empty())
    };

    let changes = match &event.kind {
        EventKind::Access(_) => Vec::new(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let (from, to) = (&event.paths[0], &event.paths[1]);
            match (synced(from), synced(to)) {
                (true, true) => vec![LocalChange::renamed(from, to)],
                (true, false) => vec![LocalChange::removed(from)],
                (false, true) => vec![LocalChange::created(to)],
                (false, false) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(LocalChange::removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
            event.paths.iter().map(LocalChange::created).collect()
        }
        EventKind::Remove(_) => event.paths.iter().map(LocalChange::removed).collect(),
        _ => event.paths.iter().map(LocalChange::modified).collect(),
    };

    changes
        .into_iter()
        .filter(|change| synced(&change.path))
        .collect()
}

/// Owns the platform watcher. Dropping or stopping it ends notifications.
pub struct FsWatcher {
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsWatcher {
    /// Starts watching `root` recursively.
    pub fn start(root: impl Into<PathBuf>, engine: EngineHandle) -> SyncResult<Self> {
        let root = root.into();
        let callback_root = root.clone();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in changes_for(&callback_root, &event) {
                        if let Err(e) = engine.local_change_blocking(change) {
                            debug!(error = %e, "Engine no longer accepts changes");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Watcher error"),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "Watching sync root");
        Ok(FsWatcher {
            root,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stops watching. Idempotent.
    pub fn stop(&self) {
        let watcher = self.watcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut watcher) = watcher {
            if let Err(e) = watcher.unwatch(&self.root) {
                debug!(error = %e, "Unwatch failed");
            }
            info!(root = %self.root.display(), "Watcher stopped");
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
