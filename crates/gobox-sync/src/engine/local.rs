//! Local change → mutation.
//!
//! Decisions are made from the current state of the filesystem and the
//! mirror, not from the notification kind alone: a notification only says
//! that a path is worth looking at.
//!
//! ```text
//! Renamed{from}  from known, target exists   → Move
//!                from known, target missing  → Trash
//! path missing   known                       → Trash
//!                unknown                     → nothing
//! symlink                                    → skipped
//! known dir                                  → nothing
//! known file     same size + mtime           → nothing (echo / no-op)
//!                otherwise                   → Update with content
//! unknown        parent known                → Create (file with content)
//! ```

use std::io::ErrorKind as IoErrorKind;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::fs;
use tracing::{debug, info};

use gobox_core::{ErrorKind, FileNode, Mutation, NodeRef};
use gobox_db::FileTreeRepository;

use super::fsops::{self, relative_segments};
use super::{with_retry, Context, LocalChange, LocalChangeKind};
use crate::error::{SyncError, SyncResult};

/// Visible node at `segments` in the mirror, if any.
pub(super) async fn lookup(
    store: &FileTreeRepository,
    segments: &[String],
) -> SyncResult<Option<FileNode>> {
    match store
        .resolve(&NodeRef::Path {
            segments: segments.to_vec(),
        })
        .await
    {
        Ok(node) => Ok(Some(node)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Plans, commits and mirrors one local change. A newly created directory
/// is followed by its contents, since the watcher may have missed entries
/// created before it started watching the directory.
pub(super) fn apply_local<'a>(ctx: &'a Context, change: LocalChange) -> BoxFuture<'a, SyncResult<()>> {
    async move {
        let Some(mutation) = plan(ctx, &change).await? else {
            return Ok(());
        };
        let new_directory = matches!(
            mutation,
            Mutation::Create {
                is_directory: true,
                ..
            }
        );

        let node = with_retry(ctx.retry_max_elapsed, || {
            let authority = ctx.authority.clone();
            let mutation = mutation.clone();
            async move { authority.submit(mutation).await }
        })
        .await?;

        ctx.store.upsert_replica(&node).await?;
        info!(id = node.id, path = %change.path.display(), kind = ?mutation.event_kind(), "Committed local change");
        ctx.observer.on_local_committed(&node);

        if new_directory {
            let mut entries = fs::read_dir(&change.path).await?;
            while let Some(entry) = entries.next_entry().await? {
                apply_local(ctx, LocalChange::created(entry.path())).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

async fn plan(ctx: &Context, change: &LocalChange) -> SyncResult<Option<Mutation>> {
    let Some(segments) = relative_segments(&ctx.root, &change.path) else {
        return Ok(None);
    };
    let Some((name, parent_segments)) = segments.split_last() else {
        return Ok(None);
    };

    if let LocalChangeKind::Renamed { from } = &change.kind {
        let source = match relative_segments(&ctx.root, from) {
            Some(from_segments) => lookup(&ctx.store, &from_segments).await?,
            None => None,
        };
        if let Some(source) = source {
            if !fsops::exists(&change.path).await {
                return Ok(Some(Mutation::Trash { id: source.id }));
            }
            let parent = require_parent(ctx, parent_segments).await?;
            return Ok(Some(Mutation::Move {
                id: source.id,
                new_parent_id: parent.id,
                new_name: name.clone(),
            }));
        }
        // Unknown source: the target is just a new path.
    }

    let known = lookup(&ctx.store, &segments).await?;
    let meta = match fs::symlink_metadata(&change.path).await {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == IoErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    match (known, meta) {
        (None, None) => Ok(None),
        (Some(node), None) => Ok(Some(Mutation::Trash { id: node.id })),
        (_, Some(meta)) if meta.file_type().is_symlink() => {
            debug!(path = %change.path.display(), "Skipping symlink");
            Ok(None)
        }
        (Some(node), Some(meta)) => {
            if node.is_directory != meta.is_dir() {
                return Err(SyncError::InvalidState(format!(
                    "'{}' changed between file and directory",
                    change.path.display()
                )));
            }
            if node.is_directory {
                return Ok(None);
            }
            let modified_at = fsops::to_timestamp(meta.modified()?);
            if node.size == meta.len() && node.modified_at == modified_at {
                return Ok(None);
            }
            let content = fs::read(&change.path).await?;
            Ok(Some(Mutation::Update {
                id: node.id,
                modified_at,
                content: Some(content),
            }))
        }
        (None, Some(meta)) => {
            let parent = require_parent(ctx, parent_segments).await?;
            let modified_at = fsops::to_timestamp(meta.modified()?);
            let content = if meta.is_dir() {
                None
            } else {
                Some(fs::read(&change.path).await?)
            };
            Ok(Some(Mutation::Create {
                parent_id: parent.id,
                name: name.clone(),
                is_directory: meta.is_dir(),
                modified_at,
                content,
            }))
        }
    }
}

async fn require_parent(ctx: &Context, segments: &[String]) -> SyncResult<FileNode> {
    match lookup(&ctx.store, segments).await? {
        Some(parent) if parent.is_directory => Ok(parent),
        Some(_) => Err(SyncError::InvalidState(format!(
            "/{} is not a directory",
            segments.join("/")
        ))),
        None => Err(SyncError::InvalidState(format!(
            "parent /{} is not synchronized yet",
            segments.join("/")
        ))),
    }
}
