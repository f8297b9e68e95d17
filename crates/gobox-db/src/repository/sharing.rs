//! # Sharing Repository
//!
//! One optional sharing record per file.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use gobox_core::{timestamp_now, NodeId, Sharing};

use crate::error::{DbError, DbResult};

#[derive(Debug, FromRow)]
struct SharingRow {
    file_id: i64,
    shared: bool,
    metadata: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SharingRow> for Sharing {
    type Error = DbError;

    fn try_from(row: SharingRow) -> DbResult<Self> {
        let metadata = row
            .metadata
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|e| {
                DbError::Corruption(format!("sharing metadata for {}: {}", row.file_id, e))
            })?;

        Ok(Sharing {
            file_id: row.file_id as NodeId,
            shared: row.shared,
            metadata,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for sharing records.
#[derive(Debug, Clone)]
pub struct SharingRepository {
    pool: SqlitePool,
}

impl SharingRepository {
    /// Creates a new SharingRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SharingRepository { pool }
    }

    /// Returns the sharing record of a file, if any.
    pub async fn find(&self, file_id: NodeId) -> DbResult<Option<Sharing>> {
        let row = sqlx::query_as::<_, SharingRow>("SELECT * FROM sharing WHERE file_id = ?1")
            .bind(file_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Sharing::try_from).transpose()
    }

    /// Creates or replaces the sharing record of a file.
    ///
    /// Fails with `NotFound` when the file doesn't exist.
    pub async fn set(
        &self,
        file_id: NodeId,
        shared: bool,
        metadata: Option<serde_json::Value>,
    ) -> DbResult<Sharing> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = ?1")
            .bind(file_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(DbError::node_not_found(file_id));
        }

        let metadata_text = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Internal(e.to_string()))?;

        let row = sqlx::query_as::<_, SharingRow>(
            r#"
            INSERT INTO sharing (file_id, shared, metadata, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (file_id) DO UPDATE SET
                shared = excluded.shared,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(file_id as i64)
        .bind(shared)
        .bind(metadata_text)
        .bind(timestamp_now())
        .fetch_one(&self.pool)
        .await?;

        debug!(file_id, shared, "Updated sharing record");
        Sharing::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use gobox_core::{ErrorKind, NodeAttrs, ROOT_ID};
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_find_keeps_one_record() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let file = db
            .tree()
            .insert(ROOT_ID, "a.txt", false, NodeAttrs::new(1, timestamp_now()))
            .await
            .unwrap();

        assert!(db.sharing().find(file.id).await.unwrap().is_none());

        db.sharing()
            .set(file.id, true, Some(json!({ "link": "abc" })))
            .await
            .unwrap();
        let updated = db.sharing().set(file.id, false, None).await.unwrap();
        assert!(!updated.shared);
        assert_eq!(updated.metadata, None);

        let found = db.sharing().find(file.id).await.unwrap().unwrap();
        assert_eq!(found, updated);
    }

    #[tokio::test]
    async fn test_set_for_unknown_file_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db.sharing().set(404, true, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_purge_drops_sharing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let file = db
            .tree()
            .insert(ROOT_ID, "a.txt", false, NodeAttrs::new(1, timestamp_now()))
            .await
            .unwrap();
        db.sharing().set(file.id, true, None).await.unwrap();

        db.tree().set_visibility(file.id, false).await.unwrap();
        db.tree().purge(file.id).await.unwrap();

        assert!(db.sharing().find(file.id).await.unwrap().is_none());
    }
}
