//! Startup reconciliation.
//!
//! ```text
//! pull_remote_tree   listChildren, breadth-first from the root
//!                      remote child            → Created event
//!                      mirror-only child       → Deleted event
//! scan_local         every entry under the root, parents first
//!                      → LocalChange::created (no-op when mirror matches)
//! ```
//!
//! Both only queue work; the engine's per-path ordering makes parents land
//! before their children.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use gobox_core::{NodeId, Origin, SyncEvent, SyncEventKind, ROOT_ID};
use gobox_db::FileTreeRepository;

use super::fsops::INTERNAL_DIR;
use super::{EngineHandle, LocalChange};
use crate::error::SyncResult;
use crate::protocol::{channels, ChildrenReply, NodeIdRequest};
use crate::transport::EventTransport;

/// Walks the storage node's tree and queues it as remote events.
///
/// Returns the number of events queued.
pub async fn pull_remote_tree(
    relay: &EventTransport,
    mirror: &FileTreeRepository,
    engine: &EngineHandle,
) -> SyncResult<usize> {
    let mut queue: VecDeque<(NodeId, Vec<String>)> = VecDeque::from([(ROOT_ID, Vec::new())]);
    let mut queued = 0usize;

    while let Some((dir_id, dir_path)) = queue.pop_front() {
        let children: ChildrenReply = relay
            .request(channels::LIST_CHILDREN, NodeIdRequest { id: dir_id })
            .await?;
        let remote_ids: HashSet<NodeId> = children.iter().map(|child| child.id).collect();

        // Visible in the mirror but gone remotely: trashed while we were away.
        if let Ok(local_children) = mirror.children(dir_id).await {
            for stale in local_children
                .into_iter()
                .filter(|child| !remote_ids.contains(&child.id))
            {
                let mut path = dir_path.clone();
                path.push(stale.name.clone());
                let mut gone = stale;
                gone.visible = false;
                engine
                    .remote_event(SyncEvent::new(SyncEventKind::Deleted, gone, path, 0, Origin::Remote))
                    .await?;
                queued += 1;
            }
        }

        for child in children {
            let mut path = dir_path.clone();
            path.push(child.name.clone());
            if child.is_directory {
                queue.push_back((child.id, path.clone()));
            }
            engine
                .remote_event(SyncEvent::new(SyncEventKind::Created, child, path, 0, Origin::Remote))
                .await?;
            queued += 1;
        }
    }

    info!(queued, "Remote tree pulled");
    Ok(queued)
}

/// Queues every entry below the root as a local creation so changes made
/// while the node was offline get committed.
pub async fn scan_local(root: &Path, engine: &EngineHandle) -> SyncResult<usize> {
    let mut queue: VecDeque<PathBuf> = VecDeque::from([root.to_path_buf()]);
    let mut queued = 0usize;

    while let Some(dir) = queue.pop_front() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if dir == root && entry.file_name() == INTERNAL_DIR {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                queue.push_back(path.clone());
            }
            engine.local_change(LocalChange::created(path)).await?;
            queued += 1;
        }
    }

    debug!(queued, root = %root.display(), "Local tree scanned");
    Ok(queued)
}
