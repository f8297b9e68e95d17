//! Remote event → local filesystem and mirror.
//!
//! Every branch first checks whether the event's effect is already in
//! place, so a re-delivered event leaves no trace. Each path the engine
//! touches is recorded in the echo guard afterwards, so the watcher's
//! report of that exact change is recognised.

use tokio::fs;
use tracing::debug;

use gobox_core::{FileNode, SyncEvent, SyncEventKind};

use super::fsops;
use super::{with_retry, Context};
use crate::error::SyncResult;

/// Applies one event. Returns false when nothing had to change.
pub(super) async fn apply_remote(ctx: &Context, event: &SyncEvent) -> SyncResult<bool> {
    let node = &event.node;
    let target = fsops::absolute(&ctx.root, &event.path);

    match event.kind {
        SyncEventKind::Created | SyncEventKind::Modified => materialize(ctx, node, &target).await,

        SyncEventKind::Deleted => match ctx.store.find(node.id).await? {
            Some(current) if current.visible => {
                fsops::remove_path(&target).await?;
                ctx.echo.record(&target).await;
                ctx.store.upsert_replica(node).await?;
                Ok(true)
            }
            _ => Ok(false),
        },

        SyncEventKind::Moved => {
            let Some(current) = ctx.store.find(node.id).await? else {
                return materialize(ctx, node, &target).await;
            };
            if current.same_state(node) && fsops::exists(&target).await {
                return Ok(false);
            }

            let from = fsops::absolute(
                &ctx.root,
                event.previous_path.as_deref().unwrap_or_default(),
            );
            if !fsops::rename_path(&from, &target).await? {
                debug!(id = node.id, from = %from.display(), "Move source missing locally, fetching");
                write_node(ctx, node, &target).await?;
            }
            ctx.echo.record(&from).await;
            ctx.echo.record(&target).await;
            ctx.store.upsert_replica(node).await?;
            Ok(true)
        }
    }
}

/// Brings `target` and the mirror to the node's state.
async fn materialize(ctx: &Context, node: &FileNode, target: &std::path::Path) -> SyncResult<bool> {
    if let Some(current) = ctx.store.find(node.id).await? {
        if current.same_state(node) && fsops::exists(target).await {
            return Ok(false);
        }
    }
    if node.visible {
        write_node(ctx, node, target).await?;
    }
    ctx.store.upsert_replica(node).await?;
    Ok(true)
}

async fn write_node(ctx: &Context, node: &FileNode, target: &std::path::Path) -> SyncResult<()> {
    if node.is_directory {
        fs::create_dir_all(target).await?;
        ctx.echo.record(target).await;
        return Ok(());
    }
    if fsops::matches_node(target, node).await {
        return Ok(());
    }

    let bytes = with_retry(ctx.retry_max_elapsed, || ctx.authority.fetch_content(node)).await?;
    fsops::write_atomic(&ctx.staging_dir, target, &bytes, node.modified_at).await?;
    ctx.echo.record(target).await;
    debug!(id = node.id, size = bytes.len(), path = %target.display(), "Wrote remote content");
    Ok(())
}
