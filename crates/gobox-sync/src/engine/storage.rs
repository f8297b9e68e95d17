//! # Storage Commit
//!
//! Applies mutations to the authoritative tree of a storage node.
//!
//! ## Commit Order
//! ```text
//! mutation ──► 1. store (transactional, invariant checks)
//!          ──► 2. filesystem (remote-origin only; local ones are already on disk)
//!          ──► 3. syncEvent broadcast to every peer
//!          ──► 4. resulting FileNode returned to the caller (query reply)
//! ```
//!
//! A store change whose filesystem step fails is undone before the error
//! is returned, so the tree and the disk never disagree.
//!
//! Trash never deletes bytes: a trashed node's content moves to
//! `<root>/.gobox/trash/<id>` and stays there until the node is purged.
//!
//! Re-applying a mutation whose effect is already in the tree (a create of
//! an identical visible node, a trash of an invisible one, a move to where
//! the node already is) returns the current node without a new event.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use gobox_core::{
    normalize_timestamp, timestamp_now, FileNode, Mutation, NodeAttrs, NodeId, Origin, SyncEvent,
    SyncEventKind, ROOT_ID,
};
use gobox_db::FileTreeRepository;

use crate::engine::echo::EchoGuard;
use crate::engine::fsops::{self, INTERNAL_DIR};
use crate::error::{SyncError, SyncResult};
use crate::protocol::channels;
use crate::transport::PeerSet;

// =============================================================================
// Event Publisher
// =============================================================================

/// Receives every committed change.
pub trait EventPublisher: Send + Sync {
    /// Returns how many peers the event was queued for.
    fn publish(&self, event: &SyncEvent) -> SyncResult<usize>;
}

impl EventPublisher for PeerSet {
    fn publish(&self, event: &SyncEvent) -> SyncResult<usize> {
        self.broadcast(channels::SYNC_EVENT, event)
    }
}

// =============================================================================
// Committer
// =============================================================================

pub struct Committer {
    store: FileTreeRepository,
    root: PathBuf,
    staging_dir: PathBuf,
    trash_dir: PathBuf,
    echo: Arc<EchoGuard>,
    publisher: Arc<dyn EventPublisher>,
    token: AtomicU64,
}

impl Committer {
    pub fn new(
        store: FileTreeRepository,
        root: impl Into<PathBuf>,
        echo: Arc<EchoGuard>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let root = root.into();
        let internal = root.join(INTERNAL_DIR);
        Committer {
            store,
            staging_dir: internal.join("staging"),
            trash_dir: internal.join("trash"),
            root,
            echo,
            publisher,
            // Tokens stay increasing across restarts.
            token: AtomicU64::new(timestamp_now().timestamp_millis().max(0) as u64 * 1000),
        }
    }

    pub fn store(&self) -> &FileTreeRepository {
        &self.store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_token(&self) -> u64 {
        self.token.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Absolute path of a visible node.
    pub async fn path_of(&self, id: NodeId) -> SyncResult<PathBuf> {
        let segments = self.store.ancestor_path(id).await?;
        Ok(fsops::absolute(&self.root, &segments))
    }

    /// Applies a mutation; see the module docs for the order of effects.
    pub async fn commit(&self, mutation: Mutation, origin: Origin) -> SyncResult<FileNode> {
        let kind = mutation.event_kind();
        let (node, event) = match mutation {
            Mutation::Create {
                parent_id,
                name,
                is_directory,
                modified_at,
                content,
            } => {
                self.create(parent_id, &name, is_directory, modified_at, content, origin)
                    .await?
            }
            Mutation::Update {
                id,
                modified_at,
                content,
            } => self.update(id, modified_at, content, origin).await?,
            Mutation::Trash { id } => self.trash(id, origin).await?,
            Mutation::Move {
                id,
                new_parent_id,
                new_name,
            } => self.relocate(id, new_parent_id, &new_name, origin).await?,
        };

        match event {
            Some(event) => {
                match self.publisher.publish(&event) {
                    Ok(peers) => debug!(id = node.id, ?kind, token = event.token, peers, "Broadcast sync event"),
                    Err(e) => warn!(id = node.id, error = %e, "Failed to broadcast sync event"),
                }
            }
            None => debug!(id = node.id, ?kind, "Mutation already applied"),
        }
        Ok(node)
    }

    async fn create(
        &self,
        parent_id: NodeId,
        name: &str,
        is_directory: bool,
        modified_at: DateTime<Utc>,
        content: Option<Vec<u8>>,
        origin: Origin,
    ) -> SyncResult<(FileNode, Option<SyncEvent>)> {
        reject_reserved(parent_id, name)?;

        let modified_at = normalize_timestamp(modified_at);
        let size = content.as_ref().map(|c| c.len() as u64).unwrap_or(0);

        if let Some(existing) = self.store.find_child(parent_id, name).await? {
            let identical = existing.is_directory == is_directory
                && (is_directory || (existing.size == size && existing.modified_at == modified_at));
            if identical {
                return Ok((existing, None));
            }
        }

        let mut path = self.store.ancestor_path(parent_id).await?;
        path.push(name.to_string());

        let attrs = if is_directory {
            NodeAttrs::directory(modified_at)
        } else {
            NodeAttrs::new(size, modified_at)
        };
        let node = self.store.insert(parent_id, name, is_directory, attrs).await?;

        if origin == Origin::Remote {
            let target = fsops::absolute(&self.root, &path);
            let written = if is_directory {
                fs::create_dir_all(&target).await.map_err(SyncError::from)
            } else {
                let bytes = content.as_deref().unwrap_or_default();
                fsops::write_atomic(&self.staging_dir, &target, bytes, modified_at).await
            };
            if let Err(e) = written {
                warn!(id = node.id, error = %e, "Write failed, rolling back insert");
                self.store.set_visibility(node.id, false).await?;
                self.store.purge(node.id).await?;
                return Err(e);
            }
            self.echo.record(&target).await;
        }

        info!(id = node.id, parent_id, name = %node.name, ?origin, "Created node");
        let event = SyncEvent::new(SyncEventKind::Created, node.clone(), path, self.next_token(), origin);
        Ok((node, Some(event)))
    }

    async fn update(
        &self,
        id: NodeId,
        modified_at: DateTime<Utc>,
        content: Option<Vec<u8>>,
        origin: Origin,
    ) -> SyncResult<(FileNode, Option<SyncEvent>)> {
        let current = self.store.get(id).await?;
        if !current.visible {
            return Err(SyncError::InvalidState(format!("node {} is trashed", id)));
        }

        let modified_at = normalize_timestamp(modified_at);
        let size = match &content {
            Some(bytes) => bytes.len() as u64,
            None => current.size,
        };
        if current.modified_at == modified_at && (current.is_directory || current.size == size) {
            return Ok((current, None));
        }

        let path = self.store.ancestor_path(id).await?;
        let node = self
            .store
            .update_attrs(id, NodeAttrs::new(size, modified_at))
            .await?;

        if origin == Origin::Remote && !node.is_directory {
            let target = fsops::absolute(&self.root, &path);
            let written = match &content {
                Some(bytes) => {
                    fsops::write_atomic(&self.staging_dir, &target, bytes, modified_at).await
                }
                None => fsops::set_modified(&target, modified_at).await,
            };
            if let Err(e) = written {
                warn!(id, error = %e, "Write failed, restoring previous attributes");
                self.store.update_attrs(id, current.attrs()).await?;
                return Err(e);
            }
            self.echo.record(&target).await;
        }

        debug!(id, size = node.size, ?origin, "Updated node");
        let event = SyncEvent::new(SyncEventKind::Modified, node.clone(), path, self.next_token(), origin);
        Ok((node, Some(event)))
    }

    async fn trash(&self, id: NodeId, origin: Origin) -> SyncResult<(FileNode, Option<SyncEvent>)> {
        let current = self.store.get(id).await?;
        if !current.visible {
            return Ok((current, None));
        }

        let path = self.store.ancestor_path(id).await?;
        let node = self.store.set_visibility(id, false).await?;

        if origin == Origin::Remote {
            let target = fsops::absolute(&self.root, &path);
            let kept = self.trash_dir.join(id.to_string());
            let moved = match fsops::remove_path(&kept).await {
                Ok(()) => fsops::rename_path(&target, &kept).await,
                Err(e) => Err(e),
            };
            match moved {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id, path = %target.display(), "Trashed node had no content on disk")
                }
                Err(e) => {
                    warn!(id, error = %e, "Moving content to trash failed, restoring node");
                    self.store.set_visibility(id, true).await?;
                    return Err(e);
                }
            }
            self.echo.record(&target).await;
        }

        info!(id, name = %node.name, ?origin, "Trashed node");
        let event = SyncEvent::new(SyncEventKind::Deleted, node.clone(), path, self.next_token(), origin);
        Ok((node, Some(event)))
    }

    async fn relocate(
        &self,
        id: NodeId,
        new_parent_id: NodeId,
        new_name: &str,
        origin: Origin,
    ) -> SyncResult<(FileNode, Option<SyncEvent>)> {
        reject_reserved(new_parent_id, new_name)?;

        let before_path = self.store.ancestor_path(id).await?;
        let (before, after) = self.store.move_node(id, new_parent_id, new_name).await?;
        if before.parent_id == after.parent_id && before.name == after.name {
            return Ok((after, None));
        }
        let after_path = self.store.ancestor_path(id).await?;

        if origin == Origin::Remote && after.visible {
            let from = fsops::absolute(&self.root, &before_path);
            let to = fsops::absolute(&self.root, &after_path);
            if let Err(e) = fsops::rename_path(&from, &to).await {
                warn!(id, error = %e, "Rename failed, restoring previous placement");
                self.store
                    .move_node(id, before.parent_id, &before.name)
                    .await?;
                return Err(e);
            }
            self.echo.record(&from).await;
            self.echo.record(&to).await;
        }

        info!(id, from = %before_path.join("/"), to = %after_path.join("/"), ?origin, "Moved node");
        let event = SyncEvent::moved(
            before,
            before_path,
            after.clone(),
            after_path,
            self.next_token(),
            origin,
        );
        Ok((after, Some(event)))
    }

    /// Scratch space inside the root that the watcher never reports.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Content of a visible file.
    pub async fn read_content(&self, id: NodeId) -> SyncResult<Vec<u8>> {
        let path = self.content_path(id).await?;
        fs::read(&path).await.map_err(|e| content_error(id, e))
    }

    /// Opens a visible file for streaming, along with its current length.
    pub async fn open_content(&self, id: NodeId) -> SyncResult<(fs::File, u64)> {
        let path = self.content_path(id).await?;
        let file = fs::File::open(&path).await.map_err(|e| content_error(id, e))?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    async fn content_path(&self, id: NodeId) -> SyncResult<PathBuf> {
        let node = self.store.get(id).await?;
        if !node.visible {
            return Err(SyncError::NotFound(format!("node {} is trashed", id)));
        }
        if node.is_directory {
            return Err(SyncError::InvalidState(format!("node {} is a directory", id)));
        }
        self.path_of(id).await
    }

    /// Physically removes a trashed node, its subtree and kept content.
    pub async fn purge(&self, id: NodeId) -> SyncResult<Vec<NodeId>> {
        let purged = self.store.purge(id).await?;
        for removed in &purged {
            fsops::remove_path(&self.trash_dir.join(removed.to_string())).await?;
        }
        info!(id, removed = purged.len(), "Purged node");
        Ok(purged)
    }
}

fn content_error(id: NodeId, err: std::io::Error) -> SyncError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            SyncError::NotFound(format!("content of node {} is missing", id))
        }
        _ => err.into(),
    }
}

fn reject_reserved(parent_id: NodeId, name: &str) -> SyncResult<()> {
    if parent_id == ROOT_ID && name == INTERNAL_DIR {
        return Err(SyncError::InvalidState(format!("'{}' is reserved", INTERNAL_DIR)));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gobox_core::ErrorKind;
    use gobox_db::{Database, DbConfig};
    use std::sync::Mutex;

    /// Keeps every published event.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub events: Mutex<Vec<SyncEvent>>,
    }

    impl RecordingPublisher {
        pub fn take(&self) -> Vec<SyncEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, event: &SyncEvent) -> SyncResult<usize> {
            self.events.lock().unwrap().push(event.clone());
            Ok(1)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        committer: Committer,
        published: Arc<RecordingPublisher>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let published = Arc::new(RecordingPublisher::default());
        let committer = Committer::new(
            db.tree(),
            &root,
            Arc::new(EchoGuard::default()),
            published.clone(),
        );
        Fixture {
            _dir: dir,
            root,
            committer,
            published,
        }
    }

    fn create(parent_id: NodeId, name: &str, content: Option<&[u8]>) -> Mutation {
        Mutation::Create {
            parent_id,
            name: name.to_string(),
            is_directory: content.is_none(),
            modified_at: timestamp_now(),
            content: content.map(<[u8]>::to_vec),
        }
    }

    #[tokio::test]
    async fn test_remote_create_writes_file_and_broadcasts() {
        let fx = fixture().await;
        let mutation = create(ROOT_ID, "notes.txt", Some(&[7u8; 500]));

        let node = fx.committer.commit(mutation.clone(), Origin::Remote).await.unwrap();
        assert_eq!(node.name, "notes.txt");
        assert_eq!(node.parent_id, ROOT_ID);
        assert!(!node.is_directory);
        assert_eq!(node.size, 500);
        assert_eq!(fs::read(fx.root.join("notes.txt")).await.unwrap().len(), 500);

        let events = fx.published.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SyncEventKind::Created);
        assert_eq!(events[0].path, vec!["notes.txt".to_string()]);

        // Re-delivery: same node back, no second event.
        let again = fx.committer.commit(mutation, Origin::Remote).await.unwrap();
        assert_eq!(again.id, node.id);
        assert!(fx.published.take().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_create_is_surfaced() {
        let fx = fixture().await;
        fx.committer
            .commit(create(ROOT_ID, "a.txt", Some(b"one")), Origin::Remote)
            .await
            .unwrap();
        let err = fx
            .committer
            .commit(create(ROOT_ID, "a.txt", Some(b"different")), Origin::Remote)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_local_create_does_not_touch_disk() {
        let fx = fixture().await;
        fx.committer
            .commit(create(ROOT_ID, "local.txt", Some(b"abc")), Origin::Local)
            .await
            .unwrap();
        assert!(!fx.root.join("local.txt").exists());
        assert_eq!(fx.published.take()[0].origin, Origin::Local);
    }

    #[tokio::test]
    async fn test_trash_keeps_content_until_purge() {
        let fx = fixture().await;
        let node = fx
            .committer
            .commit(create(ROOT_ID, "old.txt", Some(b"bytes")), Origin::Remote)
            .await
            .unwrap();
        fx.published.take();

        let trashed = fx
            .committer
            .commit(Mutation::Trash { id: node.id }, Origin::Remote)
            .await
            .unwrap();
        assert!(!trashed.visible);
        assert!(!fx.root.join("old.txt").exists());
        let kept = fx.root.join(INTERNAL_DIR).join("trash").join(node.id.to_string());
        assert_eq!(fs::read(&kept).await.unwrap(), b"bytes");
        assert_eq!(fx.published.take()[0].kind, SyncEventKind::Deleted);

        // Trashing again is a no-op.
        fx.committer
            .commit(Mutation::Trash { id: node.id }, Origin::Remote)
            .await
            .unwrap();
        assert!(fx.published.take().is_empty());

        assert_eq!(fx.committer.purge(node.id).await.unwrap(), vec![node.id]);
        assert!(!kept.exists());
        assert!(fx.committer.store().find(node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_renames_on_disk_and_carries_both_paths() {
        let fx = fixture().await;
        let docs = fx
            .committer
            .commit(create(ROOT_ID, "docs", None), Origin::Remote)
            .await
            .unwrap();
        let file = fx
            .committer
            .commit(create(ROOT_ID, "draft.txt", Some(b"text")), Origin::Remote)
            .await
            .unwrap();
        fx.published.take();

        let moved = fx
            .committer
            .commit(
                Mutation::Move {
                    id: file.id,
                    new_parent_id: docs.id,
                    new_name: "final.txt".into(),
                },
                Origin::Remote,
            )
            .await
            .unwrap();
        assert_eq!(moved.parent_id, docs.id);
        assert!(fx.root.join("docs/final.txt").exists());
        assert!(!fx.root.join("draft.txt").exists());

        let event = fx.published.take().remove(0);
        assert_eq!(event.kind, SyncEventKind::Moved);
        assert_eq!(event.previous_path, Some(vec!["draft.txt".to_string()]));
        assert_eq!(event.path, vec!["docs".to_string(), "final.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_update_and_read_content() {
        let fx = fixture().await;
        let node = fx
            .committer
            .commit(create(ROOT_ID, "a.txt", Some(b"v1")), Origin::Remote)
            .await
            .unwrap();

        let updated = fx
            .committer
            .commit(
                Mutation::Update {
                    id: node.id,
                    modified_at: node.modified_at + chrono::Duration::seconds(5),
                    content: Some(b"version two".to_vec()),
                },
                Origin::Remote,
            )
            .await
            .unwrap();
        assert_eq!(updated.size, 11);
        assert_eq!(fx.committer.read_content(node.id).await.unwrap(), b"version two");
    }

    // Failures below are forced with a file standing where a directory is
    // needed, which holds regardless of the user the tests run as.

    #[tokio::test]
    async fn test_failed_write_restores_previous_attributes() {
        let fx = fixture().await;
        let node = fx
            .committer
            .commit(create(ROOT_ID, "a.txt", Some(b"v1")), Origin::Remote)
            .await
            .unwrap();
        fx.published.take();

        let staging = fx.root.join(INTERNAL_DIR).join("staging");
        fs::remove_dir_all(&staging).await.unwrap();
        fs::write(&staging, b"in the way").await.unwrap();

        fx.committer
            .commit(
                Mutation::Update {
                    id: node.id,
                    modified_at: node.modified_at + chrono::Duration::seconds(5),
                    content: Some(b"version two".to_vec()),
                },
                Origin::Remote,
            )
            .await
            .unwrap_err();

        assert_eq!(fx.committer.store().get(node.id).await.unwrap(), node);
        assert_eq!(fs::read(fx.root.join("a.txt")).await.unwrap(), b"v1");
        assert!(fx.published.take().is_empty());
    }

    #[tokio::test]
    async fn test_failed_trash_keeps_node_visible() {
        let fx = fixture().await;
        let node = fx
            .committer
            .commit(create(ROOT_ID, "keep.txt", Some(b"bytes")), Origin::Remote)
            .await
            .unwrap();
        fx.published.take();

        fs::write(fx.root.join(INTERNAL_DIR).join("trash"), b"in the way")
            .await
            .unwrap();

        fx.committer
            .commit(Mutation::Trash { id: node.id }, Origin::Remote)
            .await
            .unwrap_err();

        let stored = fx.committer.store().get(node.id).await.unwrap();
        assert!(stored.visible);
        assert_eq!(stored, node);
        assert_eq!(fs::read(fx.root.join("keep.txt")).await.unwrap(), b"bytes");
        assert!(fx.published.take().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rename_restores_placement() {
        let fx = fixture().await;
        let docs = fx
            .committer
            .commit(create(ROOT_ID, "docs", None), Origin::Remote)
            .await
            .unwrap();
        let file = fx
            .committer
            .commit(create(ROOT_ID, "draft.txt", Some(b"text")), Origin::Remote)
            .await
            .unwrap();
        fx.published.take();

        fs::remove_dir(fx.root.join("docs")).await.unwrap();
        fs::write(fx.root.join("docs"), b"in the way").await.unwrap();

        fx.committer
            .commit(
                Mutation::Move {
                    id: file.id,
                    new_parent_id: docs.id,
                    new_name: "final.txt".into(),
                },
                Origin::Remote,
            )
            .await
            .unwrap_err();

        let stored = fx.committer.store().get(file.id).await.unwrap();
        assert_eq!(stored.parent_id, ROOT_ID);
        assert_eq!(stored.name, "draft.txt");
        assert!(fx
            .committer
            .store()
            .find_child(docs.id, "final.txt")
            .await
            .unwrap()
            .is_none());
        assert_eq!(fs::read(fx.root.join("draft.txt")).await.unwrap(), b"text");
        assert!(fx.published.take().is_empty());
    }

    #[tokio::test]
    async fn test_internal_dir_name_is_reserved() {
        let fx = fixture().await;
        let err = fx
            .committer
            .commit(create(ROOT_ID, INTERNAL_DIR, None), Origin::Remote)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
