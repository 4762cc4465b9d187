//! src/services/metadata_store.rs
//!
//! Metadata persistence behind the [`MetadataStore`] trait, with a SQLite
//! implementation holding one row per file in the `files` table.

use crate::models::file_record::FileRecord;
use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema applied by [`SqliteMetadataStore::migrate`].
const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "id, original_name, extension, size_bytes, content_type, \
     sniffed_content_type, bucket, object_key, url, version, updated_at";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("record `{0}` not found")]
    NotFound(Uuid),
    #[error("record `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error("record `{id}` changed concurrently (expected version {expected})")]
    Conflict { id: Uuid, expected: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Document storage for [`FileRecord`]s keyed by identifier.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, record: &FileRecord) -> MetadataResult<()>;

    async fn find_by_id(&self, id: Uuid) -> MetadataResult<FileRecord>;

    /// Overwrite the record, provided its stored version still equals
    /// `expected_version`. The stored version becomes `record.version`.
    async fn update(&self, id: Uuid, record: &FileRecord, expected_version: i64) -> MetadataResult<()>;

    async fn delete(&self, id: Uuid) -> MetadataResult<()>;

    async fn healthcheck(&self) -> MetadataResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Single-connection in-memory store with the schema applied.
    pub async fn in_memory() -> MetadataResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    /// Run the embedded schema statements.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: &FileRecord) -> MetadataResult<()> {
        let result = sqlx::query(
            "INSERT INTO files (
                id, original_name, extension, size_bytes, content_type,
                sniffed_content_type, bucket, object_key, url, version, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.original_name)
        .bind(&record.extension)
        .bind(record.size_bytes)
        .bind(&record.content_type)
        .bind(&record.sniffed_content_type)
        .bind(&record.bucket)
        .bind(&record.object_key)
        .bind(&record.url)
        .bind(record.version)
        .bind(record.updated_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => {
                debug!(id = %record.id, "inserted file record");
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => Err(MetadataError::AlreadyExists(record.id)),
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> MetadataResult<FileRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => MetadataError::NotFound(id),
                other => MetadataError::Sqlx(other),
            })
    }

    async fn update(&self, id: Uuid, record: &FileRecord, expected_version: i64) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE files SET
                original_name = ?, extension = ?, size_bytes = ?, content_type = ?,
                sniffed_content_type = ?, bucket = ?, object_key = ?, url = ?,
                version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&record.original_name)
        .bind(&record.extension)
        .bind(record.size_bytes)
        .bind(&record.content_type)
        .bind(&record.sniffed_content_type)
        .bind(&record.bucket)
        .bind(&record.object_key)
        .bind(&record.url)
        .bind(record.version)
        .bind(record.updated_at)
        .bind(id)
        .bind(expected_version)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing matched: tell a vanished record apart from a stale version.
        let still_there = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files WHERE id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        if still_there == 0 {
            Err(MetadataError::NotFound(id))
        } else {
            Err(MetadataError::Conflict {
                id,
                expected: expected_version,
            })
        }
    }

    async fn delete(&self, id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(id));
        }
        Ok(())
    }

    async fn healthcheck(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_record::object_key;
    use chrono::Utc;

    fn record() -> FileRecord {
        let id = Uuid::new_v4();
        FileRecord {
            id,
            original_name: "holiday".into(),
            extension: ".png".into(),
            size_bytes: 42,
            content_type: "image/png".into(),
            sniffed_content_type: "image/png".into(),
            bucket: "user-uploads".into(),
            object_key: object_key(id, ".png"),
            url: format!("http://localhost/api/v1/objects/{id}.png"),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_find_delete() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        let rec = record();
        store.insert(&rec).await.unwrap();

        let found = store.find_by_id(rec.id).await.unwrap();
        assert_eq!(found.original_name, "holiday");
        assert_eq!(found.object_key, rec.object_key);
        assert_eq!(found.version, 1);

        assert!(matches!(
            store.insert(&rec).await,
            Err(MetadataError::AlreadyExists(id)) if id == rec.id
        ));

        store.delete(rec.id).await.unwrap();
        assert!(matches!(store.find_by_id(rec.id).await, Err(MetadataError::NotFound(_))));
        assert!(matches!(store.delete(rec.id).await, Err(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_is_conditional_on_version() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        let rec = record();
        store.insert(&rec).await.unwrap();

        let mut next = rec.clone();
        next.extension = ".jpg".into();
        next.object_key = object_key(rec.id, ".jpg");
        next.version = 2;
        store.update(rec.id, &next, 1).await.unwrap();
        assert_eq!(store.find_by_id(rec.id).await.unwrap().object_key, next.object_key);

        assert!(matches!(
            store.update(rec.id, &next, 1).await,
            Err(MetadataError::Conflict { expected: 1, .. })
        ));
        assert!(matches!(
            store.update(Uuid::new_v4(), &next, 1).await,
            Err(MetadataError::NotFound(_))
        ));
    }
}
