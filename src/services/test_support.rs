//! Fault-injecting store wrappers and a ready-made service for orchestrator tests.

use crate::{
    models::file_record::FileRecord,
    services::{
        file_service::FileService,
        metadata_store::{MetadataError, MetadataResult, MetadataStore, SqliteMetadataStore},
        object_store::{BlobReader, LocalObjectStore, ObjectStore, StoreError, StoreResult},
        staging::StagedFile,
        validator::ContentValidator,
    },
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const BUCKET: &str = "user-uploads";

pub fn png_bytes() -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(&[0, 0, 0, 13]);
    data.extend_from_slice(b"IHDR");
    data.resize(96, 7);
    data
}

pub fn jpeg_bytes() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    data.extend_from_slice(b"JFIF\0");
    data.resize(150, 3);
    data
}

/// Object store that can be told to fail, hang, or cancel a token after a put.
pub struct FaultyObjects {
    pub inner: LocalObjectStore,
    pub fail_put: AtomicBool,
    pub stall_put: AtomicBool,
    /// Write the object, then never return.
    pub stall_after_put: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_healthcheck: AtomicBool,
    pub cancel_after_put: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl ObjectStore for FaultyObjects {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put(&self, key: &str, body: BlobReader, content_type: &str) -> StoreResult<String> {
        if self.stall_put.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected put fault".into()));
        }
        let url = self.inner.put(key, body, content_type).await?;
        if self.stall_after_put.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let token = self.cancel_after_put.lock().unwrap().clone();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(url)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected delete fault".into()));
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn open(&self, key: &str) -> StoreResult<(File, u64)> {
        self.inner.open(key).await
    }

    async fn healthcheck(&self) -> StoreResult<()> {
        if self.fail_healthcheck.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk /srv/blobs is read-only".into()));
        }
        self.inner.healthcheck().await
    }
}

/// Metadata store that can be told to fail inserts or updates.
pub struct FaultyMetadata {
    pub inner: SqliteMetadataStore,
    pub fail_insert: AtomicBool,
    /// Commit the insert in the background after a delay and never return.
    pub late_insert: Mutex<Option<Duration>>,
    /// Commit the insert, then never return.
    pub hang_after_insert: AtomicBool,
    pub fail_update: AtomicBool,
    pub conflict_update: AtomicBool,
}

#[async_trait]
impl MetadataStore for FaultyMetadata {
    async fn insert(&self, record: &FileRecord) -> MetadataResult<()> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(MetadataError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        let late = *self.late_insert.lock().unwrap();
        if let Some(delay) = late {
            let inner = self.inner.clone();
            let record = record.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.insert(&record).await.unwrap();
            });
            std::future::pending::<()>().await;
        }
        self.inner.insert(record).await?;
        if self.hang_after_insert.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> MetadataResult<FileRecord> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, id: Uuid, record: &FileRecord, expected_version: i64) -> MetadataResult<()> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(MetadataError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        if self.conflict_update.load(Ordering::SeqCst) {
            return Err(MetadataError::Conflict {
                id,
                expected: expected_version,
            });
        }
        self.inner.update(id, record, expected_version).await
    }

    async fn delete(&self, id: Uuid) -> MetadataResult<()> {
        self.inner.delete(id).await
    }

    async fn healthcheck(&self) -> MetadataResult<()> {
        self.inner.healthcheck().await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub objects: Arc<FaultyObjects>,
    pub metadata: Arc<FaultyMetadata>,
    pub service: FileService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5)).await
    }

    pub async fn with_timeout(store_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inner = LocalObjectStore::new(dir.path().join("objects"), BUCKET, "http://localhost:8080")
            .await
            .unwrap();
        let objects = Arc::new(FaultyObjects {
            inner,
            fail_put: AtomicBool::new(false),
            stall_put: AtomicBool::new(false),
            stall_after_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_healthcheck: AtomicBool::new(false),
            cancel_after_put: Mutex::new(None),
        });
        let metadata = Arc::new(FaultyMetadata {
            inner: SqliteMetadataStore::in_memory().await.unwrap(),
            fail_insert: AtomicBool::new(false),
            late_insert: Mutex::new(None),
            hang_after_insert: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            conflict_update: AtomicBool::new(false),
        });
        let service = FileService::new(
            objects.clone(),
            metadata.clone(),
            ContentValidator::default(),
            store_timeout,
        );
        Self {
            dir,
            objects,
            metadata,
            service,
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub async fn stage(&self, filename: &str, content_type: &str, data: &[u8]) -> StagedFile {
        StagedFile::from_bytes(&self.staging_dir(), filename, content_type, data.to_vec())
            .await
            .unwrap()
    }

    /// Blobs currently held by the object store.
    pub fn object_count(&self) -> usize {
        count_files(&self.dir.path().join("objects").join(BUCKET))
    }

    pub async fn record_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&*self.metadata.inner.db)
            .await
            .unwrap()
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .map(|entry| entry.unwrap().path())
        .map(|path| if path.is_dir() { count_files(&path) } else { 1 })
        .sum()
}
