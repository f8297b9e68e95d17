//! # File Tree Repository
//!
//! The addressable hierarchy of files and directories.
//!
//! ## Tree Invariants
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       nodes table                                       │
//! │                                                                         │
//! │   id 0 (root, parent 0)                                                │
//! │    ├── 1 docs/            visible                                      │
//! │    │    ├── 4 report.pdf  visible                                      │
//! │    │    └── 5 report.pdf  trashed   ← same name allowed once hidden    │
//! │    └── 2 notes.txt        visible                                      │
//! │                                                                         │
//! │  • parent graph is acyclic and every chain ends at 0                    │
//! │  • ids come from AUTOINCREMENT and are never reused                     │
//! │  • visible siblings have distinct names (checked in the transaction,    │
//! │    backed by a partial UNIQUE index)                                    │
//! │  • size/mime are zero/NULL for directories                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resolution
//! A [`NodeRef`] addresses a node by id, by `(parent, name)` or by a path
//! walked from the root. Name based lookups only see visible nodes; id
//! lookups see trashed nodes too.
//!
//! ## Trash
//! Deleting marks a node invisible. Rows are physically removed only by
//! [`FileTreeRepository::purge`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use gobox_core::mime::guess_mime;
use gobox_core::validation::{validate_name, validate_segments};
use gobox_core::{timestamp_now, FileNode, NodeAttrs, NodeId, NodeRef, ROOT_ID};

use crate::error::{DbError, DbResult};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct NodeRow {
    id: i64,
    parent_id: i64,
    name: String,
    is_directory: bool,
    visible: bool,
    size: i64,
    mime: Option<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl From<NodeRow> for FileNode {
    fn from(row: NodeRow) -> Self {
        FileNode {
            id: row.id as NodeId,
            parent_id: row.parent_id as NodeId,
            name: row.name,
            is_directory: row.is_directory,
            visible: row.visible,
            size: row.size.max(0) as u64,
            created_at: row.created_at,
            modified_at: row.modified_at,
            mime: row.mime,
        }
    }
}

/// Result of applying a node received from the storage node to a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Inserted,
    Updated,
    /// The mirror already held exactly this state.
    Unchanged,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the file tree.
#[derive(Debug, Clone)]
pub struct FileTreeRepository {
    pool: SqlitePool,
}

impl FileTreeRepository {
    /// Creates a new FileTreeRepository.
    pub fn new(pool: SqlitePool) -> Self {
        FileTreeRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Gets a node by id, visible or not.
    pub async fn get(&self, id: NodeId) -> DbResult<FileNode> {
        let mut conn = self.pool.acquire().await?;
        require_node(&mut conn, id).await
    }

    /// Finds a node by id, returning `None` when it doesn't exist.
    pub async fn find(&self, id: NodeId) -> DbResult<Option<FileNode>> {
        let mut conn = self.pool.acquire().await?;
        fetch_node(&mut conn, id).await
    }

    /// Finds the visible child of `parent_id` named `name`.
    pub async fn find_child(&self, parent_id: NodeId, name: &str) -> DbResult<Option<FileNode>> {
        let mut conn = self.pool.acquire().await?;
        fetch_visible_child(&mut conn, parent_id, name).await
    }

    /// Resolves a reference to a node.
    ///
    /// ## Path Walk
    /// ```text
    /// ["docs", "report.pdf"]
    ///   root ──visible child "docs"──► docs ──visible child "report.pdf"──► ✗
    ///                                          NotFound('report.pdf' in /docs)
    /// ```
    /// The walk stops at the first missing segment; later segments are
    /// never looked at.
    pub async fn resolve(&self, node_ref: &NodeRef) -> DbResult<FileNode> {
        let mut conn = self.pool.acquire().await?;

        match node_ref {
            NodeRef::Id { id } => require_node(&mut conn, *id).await,

            NodeRef::Child { parent_id, name } => {
                fetch_visible_child(&mut conn, *parent_id, name)
                    .await?
                    .ok_or_else(|| {
                        DbError::not_found("Node", format!("'{}' in directory {}", name, parent_id))
                    })
            }

            NodeRef::Path { segments } => {
                validate_segments(segments)?;

                let mut current = require_node(&mut conn, ROOT_ID).await?;
                for (depth, segment) in segments.iter().enumerate() {
                    current = fetch_visible_child(&mut conn, current.id, segment)
                        .await?
                        .ok_or_else(|| {
                            DbError::not_found(
                                "Node",
                                format!("'{}' in /{}", segment, segments[..depth].join("/")),
                            )
                        })?;
                }
                Ok(current)
            }
        }
    }

    /// Visible children of a directory, ordered by name.
    pub async fn children(&self, id: NodeId) -> DbResult<Vec<FileNode>> {
        let mut conn = self.pool.acquire().await?;

        let node = require_node(&mut conn, id).await?;
        if !node.is_directory {
            return Err(DbError::InvalidState(format!(
                "node {} ('{}') is not a directory",
                id, node.name
            )));
        }

        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM nodes WHERE parent_id = ?1 AND visible = 1 AND id != 0 ORDER BY name",
        )
        .bind(id as i64)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(FileNode::from).collect())
    }

    /// Nodes from the first level below the root down to `id`, root-first.
    ///
    /// Empty for the root itself. Fails with `Corruption` when the chain
    /// does not reach the root within as many steps as there are nodes, or
    /// visits an id twice.
    pub async fn ancestors(&self, id: NodeId) -> DbResult<Vec<FileNode>> {
        let mut conn = self.pool.acquire().await?;
        ancestor_chain(&mut conn, id).await
    }

    /// Names from the root down to `id`, root-first.
    pub async fn ancestor_path(&self, id: NodeId) -> DbResult<Vec<String>> {
        Ok(self
            .ancestors(id)
            .await?
            .into_iter()
            .map(|node| node.name)
            .collect())
    }

    /// Total number of rows, root and trashed nodes included.
    pub async fn count(&self) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        node_count(&mut conn).await
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Inserts a new node under `parent_id`.
    ///
    /// ## Errors
    /// - `NotFound` - parent doesn't exist
    /// - `InvalidState` - parent is a file or is trashed
    /// - `Conflict` - a visible sibling already holds `name`
    pub async fn insert(
        &self,
        parent_id: NodeId,
        name: &str,
        is_directory: bool,
        attrs: NodeAttrs,
    ) -> DbResult<FileNode> {
        validate_name(name)?;

        let mut tx = self.pool.begin().await?;

        require_directory(&mut tx, parent_id).await?;
        ensure_name_free(&mut tx, parent_id, name, None).await?;

        let (size, mime) = if is_directory {
            (0, None)
        } else {
            let mime = attrs
                .mime
                .or_else(|| guess_mime(name).map(str::to_string));
            (attrs.size as i64, mime)
        };
        let now = timestamp_now();

        let row = sqlx::query_as::<_, NodeRow>(
            r#"
            INSERT INTO nodes (parent_id, name, is_directory, visible, size, mime, created_at, modified_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
            RETURNING *
            "#,
        )
        .bind(parent_id as i64)
        .bind(name)
        .bind(is_directory)
        .bind(size)
        .bind(mime)
        .bind(now)
        .bind(attrs.modified_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| sibling_conflict(e.into(), parent_id, name))?;

        tx.commit().await?;

        let node = FileNode::from(row);
        debug!(id = node.id, parent_id, name = %node.name, is_directory, "Inserted node");
        Ok(node)
    }

    /// Marks a node visible (restore) or invisible (trash).
    ///
    /// Restoring re-checks sibling name uniqueness. Setting the current
    /// value again is a no-op that returns the node unchanged.
    pub async fn set_visibility(&self, id: NodeId, visible: bool) -> DbResult<FileNode> {
        if id == ROOT_ID {
            return Err(DbError::InvalidState("the root cannot be trashed".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let node = require_node(&mut tx, id).await?;
        if node.visible == visible {
            return Ok(node);
        }

        if visible {
            require_directory(&mut tx, node.parent_id).await?;
            ensure_name_free(&mut tx, node.parent_id, &node.name, Some(id)).await?;
        }

        let row = sqlx::query_as::<_, NodeRow>(
            "UPDATE nodes SET visible = ?2 WHERE id = ?1 RETURNING *",
        )
        .bind(id as i64)
        .bind(visible)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| sibling_conflict(e.into(), node.parent_id, &node.name))?;

        tx.commit().await?;

        debug!(id, visible, "Changed node visibility");
        Ok(row.into())
    }

    /// Moves and/or renames a node, returning `(before, after)`.
    ///
    /// ## Errors
    /// - `InvalidState` - moving the root, into a file, or into its own subtree
    /// - `Conflict` - the destination already has a visible `new_name`
    pub async fn move_node(
        &self,
        id: NodeId,
        new_parent_id: NodeId,
        new_name: &str,
    ) -> DbResult<(FileNode, FileNode)> {
        if id == ROOT_ID {
            return Err(DbError::InvalidState("the root cannot be moved".to_string()));
        }
        validate_name(new_name)?;

        let mut tx = self.pool.begin().await?;

        let before = require_node(&mut tx, id).await?;
        if before.parent_id == new_parent_id && before.name == new_name {
            return Ok((before.clone(), before));
        }

        require_directory(&mut tx, new_parent_id).await?;

        if before.is_directory {
            let destination_chain = ancestor_chain(&mut tx, new_parent_id).await?;
            if new_parent_id == id || destination_chain.iter().any(|n| n.id == id) {
                return Err(DbError::InvalidState(format!(
                    "cannot move directory {} into its own subtree",
                    id
                )));
            }
        }

        if before.visible {
            ensure_name_free(&mut tx, new_parent_id, new_name, Some(id)).await?;
        }

        let row = sqlx::query_as::<_, NodeRow>(
            "UPDATE nodes SET parent_id = ?2, name = ?3 WHERE id = ?1 RETURNING *",
        )
        .bind(id as i64)
        .bind(new_parent_id as i64)
        .bind(new_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| sibling_conflict(e.into(), new_parent_id, new_name))?;

        tx.commit().await?;

        let after = FileNode::from(row);
        debug!(
            id,
            from_parent = before.parent_id,
            to_parent = after.parent_id,
            name = %after.name,
            "Moved node"
        );
        Ok((before, after))
    }

    /// Reparents a node under `parent_id`, keeping its name.
    ///
    /// The same checks as [`move_node`](Self::move_node) apply.
    pub async fn set_parent_id(&self, id: NodeId, parent_id: NodeId) -> DbResult<FileNode> {
        let node = self.get(id).await?;
        let (_, after) = self.move_node(id, parent_id, &node.name).await?;
        Ok(after)
    }

    /// Updates size, mime and modification time.
    ///
    /// Directories only take the modification time. A missing mime keeps
    /// the stored one.
    pub async fn update_attrs(&self, id: NodeId, attrs: NodeAttrs) -> DbResult<FileNode> {
        let mut tx = self.pool.begin().await?;

        let node = require_node(&mut tx, id).await?;
        let (size, mime) = if node.is_directory {
            (0, None)
        } else {
            (attrs.size as i64, attrs.mime.or(node.mime))
        };

        let row = sqlx::query_as::<_, NodeRow>(
            "UPDATE nodes SET size = ?2, mime = ?3, modified_at = ?4 WHERE id = ?1 RETURNING *",
        )
        .bind(id as i64)
        .bind(size)
        .bind(mime)
        .bind(attrs.modified_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    /// Writes a node exactly as the storage node described it.
    ///
    /// Mirrors call this to adopt authoritative ids and attributes. Applying
    /// the same node twice yields [`ReplicaOutcome::Unchanged`].
    pub async fn upsert_replica(&self, node: &FileNode) -> DbResult<ReplicaOutcome> {
        if node.is_root() {
            return Ok(ReplicaOutcome::Unchanged);
        }
        validate_name(&node.name)?;

        let mut tx = self.pool.begin().await?;

        let existing = fetch_node(&mut tx, node.id).await?;
        if let Some(current) = &existing {
            if current.same_state(node) {
                return Ok(ReplicaOutcome::Unchanged);
            }
            if current.is_directory != node.is_directory {
                return Err(DbError::InvalidState(format!(
                    "node {} cannot change between file and directory",
                    node.id
                )));
            }
        }

        require_node(&mut tx, node.parent_id).await?;
        if node.visible {
            ensure_name_free(&mut tx, node.parent_id, &node.name, Some(node.id)).await?;
        }

        let size = if node.is_directory { 0 } else { node.size as i64 };
        let mime = if node.is_directory { None } else { node.mime.clone() };

        let outcome = if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE nodes
                SET parent_id = ?2, name = ?3, visible = ?4, size = ?5, mime = ?6, modified_at = ?7
                WHERE id = ?1
                "#,
            )
            .bind(node.id as i64)
            .bind(node.parent_id as i64)
            .bind(&node.name)
            .bind(node.visible)
            .bind(size)
            .bind(mime)
            .bind(node.modified_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| sibling_conflict(e.into(), node.parent_id, &node.name))?;
            ReplicaOutcome::Updated
        } else {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, parent_id, name, is_directory, visible, size, mime, created_at, modified_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(node.id as i64)
            .bind(node.parent_id as i64)
            .bind(&node.name)
            .bind(node.is_directory)
            .bind(node.visible)
            .bind(size)
            .bind(mime)
            .bind(node.created_at)
            .bind(node.modified_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| sibling_conflict(e.into(), node.parent_id, &node.name))?;
            ReplicaOutcome::Inserted
        };

        tx.commit().await?;

        debug!(id = node.id, ?outcome, "Applied replica node");
        Ok(outcome)
    }

    /// Physically removes a trashed node and its whole subtree.
    ///
    /// Returns the removed ids, `id` first. Sharing rows go with them.
    pub async fn purge(&self, id: NodeId) -> DbResult<Vec<NodeId>> {
        if id == ROOT_ID {
            return Err(DbError::InvalidState("the root cannot be purged".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let node = require_node(&mut tx, id).await?;
        if node.visible {
            return Err(DbError::InvalidState(format!(
                "node {} is visible; trash it before purging",
                id
            )));
        }

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT ?1
                UNION
                SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id WHERE n.id != 0
            )
            SELECT id FROM subtree
            "#,
        )
        .bind(id as i64)
        .fetch_all(&mut *tx)
        .await?;

        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM nodes WHERE id IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for removed in chunk {
                query = query.bind(*removed);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!(id, removed = ids.len(), "Purged node subtree");
        Ok(ids.into_iter().map(|i| i as NodeId).collect())
    }
}

// =============================================================================
// Connection-level helpers
// =============================================================================
// Shared by pooled reads and transactional writes so that invariant checks
// run on the same connection as the write they guard.

async fn fetch_node(conn: &mut SqliteConnection, id: NodeId) -> DbResult<Option<FileNode>> {
    let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?1")
        .bind(id as i64)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(FileNode::from))
}

async fn require_node(conn: &mut SqliteConnection, id: NodeId) -> DbResult<FileNode> {
    fetch_node(conn, id)
        .await?
        .ok_or_else(|| DbError::node_not_found(id))
}

async fn require_directory(conn: &mut SqliteConnection, id: NodeId) -> DbResult<FileNode> {
    let node = require_node(conn, id).await?;
    if !node.is_directory {
        return Err(DbError::InvalidState(format!(
            "node {} ('{}') is not a directory",
            id, node.name
        )));
    }
    if !node.visible {
        return Err(DbError::InvalidState(format!("directory {} is trashed", id)));
    }
    Ok(node)
}

async fn fetch_visible_child(
    conn: &mut SqliteConnection,
    parent_id: NodeId,
    name: &str,
) -> DbResult<Option<FileNode>> {
    let row = sqlx::query_as::<_, NodeRow>(
        "SELECT * FROM nodes WHERE parent_id = ?1 AND name = ?2 AND visible = 1 AND id != 0",
    )
    .bind(parent_id as i64)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(FileNode::from))
}

async fn ensure_name_free(
    conn: &mut SqliteConnection,
    parent_id: NodeId,
    name: &str,
    except: Option<NodeId>,
) -> DbResult<()> {
    match fetch_visible_child(conn, parent_id, name).await? {
        Some(existing) if Some(existing.id) != except => Err(DbError::conflict(parent_id, name)),
        _ => Ok(()),
    }
}

async fn node_count(conn: &mut SqliteConnection) -> DbResult<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

async fn ancestor_chain(conn: &mut SqliteConnection, id: NodeId) -> DbResult<Vec<FileNode>> {
    let bound = node_count(conn).await?;

    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = require_node(conn, id).await?;

    while !current.is_root() {
        if !seen.insert(current.id) || chain.len() as u64 >= bound {
            warn!(id, bound, "Ancestor walk did not reach the root");
            return Err(DbError::Corruption(format!(
                "node {} does not reach the root within {} steps",
                id, bound
            )));
        }

        let parent_id = current.parent_id;
        let child_id = current.id;
        chain.push(current);

        current = fetch_node(conn, parent_id).await?.ok_or_else(|| {
            DbError::Corruption(format!("node {} has dangling parent {}", child_id, parent_id))
        })?;
    }

    chain.reverse();
    Ok(chain)
}

/// Turns a UNIQUE index violation into a sibling name conflict.
fn sibling_conflict(err: DbError, parent_id: NodeId, name: &str) -> DbError {
    match err {
        DbError::UniqueViolation { .. } => DbError::conflict(parent_id, name),
        other => other,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use gobox_core::ErrorKind;

    async fn repo() -> FileTreeRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().tree()
    }

    fn file_attrs(size: u64) -> NodeAttrs {
        NodeAttrs::new(size, timestamp_now())
    }

    fn dir_attrs() -> NodeAttrs {
        NodeAttrs::directory(timestamp_now())
    }

    #[tokio::test]
    async fn test_insert_allocates_id_and_guesses_mime() {
        let tree = repo().await;

        let node = tree
            .insert(ROOT_ID, "notes.txt", false, file_attrs(500))
            .await
            .unwrap();

        assert!(node.id > 0);
        assert_eq!(node.parent_id, ROOT_ID);
        assert_eq!(node.size, 500);
        assert!(node.visible);
        assert_eq!(node.mime.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_insert_conflicting_name_fails() {
        let tree = repo().await;
        tree.insert(ROOT_ID, "notes.txt", false, file_attrs(1))
            .await
            .unwrap();

        let err = tree
            .insert(ROOT_ID, "notes.txt", true, dir_attrs())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { parent_id: 0, .. }));
    }

    #[tokio::test]
    async fn test_insert_under_file_or_missing_parent() {
        let tree = repo().await;
        let file = tree
            .insert(ROOT_ID, "a.txt", false, file_attrs(1))
            .await
            .unwrap();

        let err = tree.insert(file.id, "b", false, file_attrs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = tree.insert(999, "b", false, file_attrs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = tree.insert(ROOT_ID, "a/b", false, file_attrs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_directories_ignore_size_and_mime() {
        let tree = repo().await;
        let dir = tree
            .insert(ROOT_ID, "photos.png", true, file_attrs(42).with_mime("image/png"))
            .await
            .unwrap();
        assert_eq!(dir.size, 0);
        assert_eq!(dir.mime, None);
    }

    #[tokio::test]
    async fn test_resolve_three_ways_agree() {
        let tree = repo().await;
        let docs = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        let report = tree
            .insert(docs.id, "report.pdf", false, file_attrs(10))
            .await
            .unwrap();

        let by_id = tree.resolve(&NodeRef::id(report.id)).await.unwrap();
        let by_child = tree
            .resolve(&NodeRef::child(docs.id, "report.pdf"))
            .await
            .unwrap();
        let by_path = tree
            .resolve(&NodeRef::path("docs/report.pdf"))
            .await
            .unwrap();

        assert_eq!(by_id, report);
        assert_eq!(by_child, report);
        assert_eq!(by_path, report);
        assert!(tree.resolve(&NodeRef::path("")).await.unwrap().is_root());
    }

    #[tokio::test]
    async fn test_resolve_path_stops_at_first_missing_segment() {
        let tree = repo().await;
        tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();

        let err = tree
            .resolve(&NodeRef::path("docs/report.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Node not found: 'report.pdf' in /docs");

        let err = tree
            .resolve(&NodeRef::path("missing/report.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Node not found: 'missing' in /");
    }

    #[tokio::test]
    async fn test_children_are_visible_and_sorted() {
        let tree = repo().await;
        let docs = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        tree.insert(docs.id, "b.txt", false, file_attrs(1)).await.unwrap();
        let hidden = tree.insert(docs.id, "c.txt", false, file_attrs(1)).await.unwrap();
        tree.insert(docs.id, "a.txt", false, file_attrs(1)).await.unwrap();
        tree.set_visibility(hidden.id, false).await.unwrap();

        let names: Vec<String> = tree
            .children(docs.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let root_children = tree.children(ROOT_ID).await.unwrap();
        assert_eq!(root_children.len(), 1, "root never lists itself");
    }

    #[tokio::test]
    async fn test_children_errors() {
        let tree = repo().await;
        let file = tree.insert(ROOT_ID, "a.txt", false, file_attrs(1)).await.unwrap();

        assert_eq!(
            tree.children(file.id).await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(tree.children(77).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_ancestor_path_is_root_first() {
        let tree = repo().await;
        let a = tree.insert(ROOT_ID, "a", true, dir_attrs()).await.unwrap();
        let b = tree.insert(a.id, "b", true, dir_attrs()).await.unwrap();
        let c = tree.insert(b.id, "c.txt", false, file_attrs(1)).await.unwrap();

        assert_eq!(tree.ancestor_path(c.id).await.unwrap(), vec!["a", "b", "c.txt"]);
        assert!(tree.ancestor_path(ROOT_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ancestor_path_detects_cycles() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let tree = db.tree();
        let a = tree.insert(ROOT_ID, "a", true, dir_attrs()).await.unwrap();
        let b = tree.insert(a.id, "b", true, dir_attrs()).await.unwrap();

        sqlx::query("UPDATE nodes SET parent_id = ?1 WHERE id = ?2")
            .bind(b.id as i64)
            .bind(a.id as i64)
            .execute(db.pool())
            .await
            .unwrap();

        let err = tree.ancestor_path(b.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn test_trash_frees_name_and_restore_rechecks() {
        let tree = repo().await;
        let old = tree.insert(ROOT_ID, "a.txt", false, file_attrs(1)).await.unwrap();

        let trashed = tree.set_visibility(old.id, false).await.unwrap();
        assert!(!trashed.visible);
        // Trashing twice is a no-op
        assert_eq!(tree.set_visibility(old.id, false).await.unwrap(), trashed);

        tree.insert(ROOT_ID, "a.txt", false, file_attrs(2)).await.unwrap();

        let err = tree.set_visibility(old.id, true).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        assert_eq!(
            tree.set_visibility(ROOT_ID, false).await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn test_move_rechecks_destination_name() {
        let tree = repo().await;
        let docs = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        let a = tree.insert(ROOT_ID, "a.txt", false, file_attrs(1)).await.unwrap();
        tree.insert(docs.id, "a.txt", false, file_attrs(1)).await.unwrap();

        let err = tree.move_node(a.id, docs.id, "a.txt").await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));

        let (before, after) = tree.move_node(a.id, docs.id, "b.txt").await.unwrap();
        assert_eq!(before.parent_id, ROOT_ID);
        assert_eq!(after.parent_id, docs.id);
        assert_eq!(after.name, "b.txt");
        assert_eq!(after.id, a.id);
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_is_rejected() {
        let tree = repo().await;
        let a = tree.insert(ROOT_ID, "a", true, dir_attrs()).await.unwrap();
        let b = tree.insert(a.id, "b", true, dir_attrs()).await.unwrap();

        let err = tree.move_node(a.id, b.id, "a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = tree.move_node(a.id, a.id, "a2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = tree.move_node(ROOT_ID, a.id, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_set_parent_id_assigns_the_given_parent() {
        let tree = repo().await;
        let docs = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        let file = tree.insert(ROOT_ID, "a.txt", false, file_attrs(1)).await.unwrap();

        let moved = tree.set_parent_id(file.id, docs.id).await.unwrap();

        assert_eq!(moved.parent_id, docs.id);
        assert_ne!(moved.parent_id, file.id);
        assert_eq!(tree.get(file.id).await.unwrap().parent_id, docs.id);
        assert_eq!(tree.ancestor_path(file.id).await.unwrap(), vec!["docs", "a.txt"]);
    }

    #[tokio::test]
    async fn test_update_attrs_keeps_mime_when_absent() {
        let tree = repo().await;
        let file = tree.insert(ROOT_ID, "a.txt", false, file_attrs(1)).await.unwrap();

        let later = file.modified_at + chrono::Duration::seconds(5);
        let updated = tree
            .update_attrs(file.id, NodeAttrs::new(900, later))
            .await
            .unwrap();
        assert_eq!(updated.size, 900);
        assert_eq!(updated.modified_at, later);
        assert_eq!(updated.mime.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_upsert_replica_is_idempotent() {
        let source = repo().await;
        let mirror = repo().await;
        let docs = source.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        let file = source.insert(docs.id, "a.txt", false, file_attrs(3)).await.unwrap();

        assert_eq!(mirror.upsert_replica(&docs).await.unwrap(), ReplicaOutcome::Inserted);
        assert_eq!(mirror.upsert_replica(&file).await.unwrap(), ReplicaOutcome::Inserted);
        assert_eq!(mirror.upsert_replica(&file).await.unwrap(), ReplicaOutcome::Unchanged);

        let (_, renamed) = source.move_node(file.id, ROOT_ID, "b.txt").await.unwrap();
        assert_eq!(mirror.upsert_replica(&renamed).await.unwrap(), ReplicaOutcome::Updated);
        assert_eq!(mirror.get(file.id).await.unwrap(), renamed);
    }

    #[tokio::test]
    async fn test_upsert_replica_requires_parent() {
        let mirror = repo().await;
        let orphan = FileNode {
            id: 10,
            parent_id: 9,
            name: "x".to_string(),
            is_directory: false,
            visible: true,
            size: 1,
            created_at: timestamp_now(),
            modified_at: timestamp_now(),
            mime: None,
        };
        assert_eq!(
            mirror.upsert_replica(&orphan).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_purge_removes_subtree_and_ids_are_not_reused() {
        let tree = repo().await;
        let docs = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        let inner = tree.insert(docs.id, "a.txt", false, file_attrs(1)).await.unwrap();

        let err = tree.purge(docs.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState, "visible nodes are not purged");

        tree.set_visibility(docs.id, false).await.unwrap();
        let removed = tree.purge(docs.id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&inner.id));
        assert_eq!(tree.count().await.unwrap(), 1);

        let fresh = tree.insert(ROOT_ID, "docs", true, dir_attrs()).await.unwrap();
        assert!(fresh.id > inner.id);
    }
}
