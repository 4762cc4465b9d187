//! src/services/file_service.rs
//!
//! FileService coordinates the object store and the metadata store for
//! upload, replace, delete and get. There is no shared transaction between the
//! two stores: writes are ordered blob-first, metadata-second, and a failed
//! metadata step is undone by deleting the blob it was meant to describe.
//! Compensating deletes run once and their failure is logged, never returned.

use crate::{
    models::file_record::{FileRecord, object_key},
    services::{
        metadata_store::{MetadataError, MetadataStore},
        object_store::{ObjectStore, StoreError},
        staging::StagedFile,
        validator::{ContentValidator, ValidationError, file_stem},
    },
};
use chrono::Utc;
use std::{future::Future, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("file `{0}` not found")]
    RecordNotFound(Uuid),
    #[error("file `{0}` was modified by a concurrent request")]
    Conflict(Uuid),
    #[error("failed to stage upload: {0}")]
    Staging(#[source] io::Error),
    #[error("failed to write object `{key}`: {source}")]
    StorageWriteFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to delete object `{key}`: {source}")]
    StorageDeleteFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to read object `{key}`: {source}")]
    StorageReadFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to read metadata for `{id}`: {source}")]
    MetadataReadFailed {
        id: Uuid,
        #[source]
        source: MetadataError,
    },
    #[error("failed to write metadata for `{id}`: {source}")]
    MetadataWriteFailed {
        id: Uuid,
        #[source]
        source: MetadataError,
    },
    #[error("failed to update metadata for `{id}`: {source}")]
    MetadataUpdateFailed {
        id: Uuid,
        #[source]
        source: MetadataError,
    },
    #[error("failed to delete metadata for `{id}`: {source}")]
    MetadataDeleteFailed {
        id: Uuid,
        #[source]
        source: MetadataError,
    },
    #[error("compensating delete of object `{key}` failed: {source}")]
    CompensationFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("{0} was cancelled")]
    Cancelled(&'static str),
    #[error("{0} timed out")]
    TimedOut(&'static str),
}

pub type FileResult<T> = Result<T, FileError>;

/// Readiness of both backing stores, with the failure text of each check.
#[derive(Debug)]
pub struct StoreHealth {
    pub objects: Result<(), String>,
    pub metadata: Result<(), String>,
}

#[derive(Clone)]
pub struct FileService {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    validator: ContentValidator,
    store_timeout: Duration,
}

impl FileService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        validator: ContentValidator,
        store_timeout: Duration,
    ) -> Self {
        Self {
            objects,
            metadata,
            validator,
            store_timeout,
        }
    }

    /// Run one store call under the per-call timeout, giving up early if
    /// `cancel` fires first.
    async fn bounded<F, T>(&self, op: &'static str, cancel: &CancellationToken, call: F) -> FileResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FileError::Cancelled(op)),
            res = tokio::time::timeout(self.store_timeout, call) => res.map_err(|_| FileError::TimedOut(op)),
        }
    }

    /// Run a commit step under the timeout only. Commit steps restore
    /// consistency between the stores, so cancellation must not cut them off.
    async fn committed<F, T>(&self, op: &'static str, call: F) -> FileResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| FileError::TimedOut(op))
    }

    /// Delete a blob written earlier in a request that later failed.
    async fn compensate(&self, key: &str) {
        match self.committed("compensating delete", self.objects.delete(key)).await {
            Ok(Ok(())) | Ok(Err(StoreError::NotFound(_))) => {
                debug!(key, "compensating delete removed object");
            }
            Ok(Err(source)) => {
                let err = FileError::CompensationFailed {
                    key: key.to_string(),
                    source,
                };
                error!(key, error = %err, "orphaned object left in store");
            }
            Err(err) => {
                error!(key, error = %err, "orphaned object may be left in store");
            }
        }
    }

    async fn find(&self, id: Uuid, cancel: &CancellationToken) -> FileResult<FileRecord> {
        self.bounded("metadata lookup", cancel, self.metadata.find_by_id(id))
            .await?
            .map_err(|source| match source {
                MetadataError::NotFound(_) => FileError::RecordNotFound(id),
                source => FileError::MetadataReadFailed { id, source },
            })
    }

    /// Admit, store and record a new file. Returns the stored record.
    pub async fn upload(&self, staged: &StagedFile, cancel: &CancellationToken) -> FileResult<FileRecord> {
        let mut reader = staged.open().await.map_err(FileError::Staging)?;
        let admitted = self.validator.admit_upload(staged.filename(), &mut reader).await?;

        let id = Uuid::new_v4();
        let key = object_key(id, &admitted.extension);

        let put = self
            .bounded("object upload", cancel, self.objects.put(&key, Box::pin(reader), staged.content_type()))
            .await;
        let url = match put {
            Ok(Ok(url)) => url,
            Ok(Err(source)) => return Err(FileError::StorageWriteFailed { key, source }),
            Err(interrupted) => {
                self.compensate(&key).await;
                return Err(interrupted);
            }
        };

        // Last point at which giving up leaves both stores untouched.
        if cancel.is_cancelled() {
            self.compensate(&key).await;
            return Err(FileError::Cancelled("upload"));
        }

        let record = FileRecord {
            id,
            original_name: file_stem(staged.filename()),
            extension: admitted.extension,
            size_bytes: staged.size_bytes(),
            content_type: staged.content_type().to_string(),
            sniffed_content_type: admitted.sniffed_type.to_string(),
            bucket: self.objects.bucket().to_string(),
            object_key: key.clone(),
            url,
            version: 1,
            updated_at: Utc::now(),
        };

        match self.committed("metadata insert", self.metadata.insert(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                warn!(%id, %key, error = %source, "metadata insert failed, removing object");
                self.compensate(&key).await;
                return Err(FileError::MetadataWriteFailed { id, source });
            }
            Err(timed_out) => {
                // The insert may still land. The blob is only removed once the
                // record is known to be gone; otherwise it stays behind.
                match self.committed("metadata cleanup", self.metadata.delete(id)).await {
                    Ok(Ok(())) => self.compensate(&key).await,
                    Ok(Err(MetadataError::NotFound(_))) => {
                        error!(%id, %key, "metadata insert outcome unknown, keeping object");
                    }
                    Ok(Err(source)) => {
                        error!(%id, %key, error = %source, "metadata cleanup failed, keeping object");
                    }
                    Err(err) => {
                        error!(%id, %key, error = %err, "metadata cleanup failed, keeping object");
                    }
                }
                return Err(timed_out);
            }
        }

        info!(%id, %key, size_bytes = record.size_bytes, "file uploaded");
        Ok(record)
    }

    /// Swap the blob behind `id` for a new one and update its record in place.
    pub async fn replace(
        &self,
        id: Uuid,
        staged: &StagedFile,
        cancel: &CancellationToken,
    ) -> FileResult<FileRecord> {
        let mut reader = staged.open().await.map_err(FileError::Staging)?;
        let admitted = self.validator.admit_replace(staged.filename(), &mut reader).await?;

        let existing = self.find(id, cancel).await?;

        let old_key = object_key(existing.id, &existing.extension);
        match self.bounded("object delete", cancel, self.objects.delete(&old_key)).await? {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(source) => return Err(FileError::StorageDeleteFailed { key: old_key, source }),
        }

        let new_key = object_key(id, &admitted.extension);
        let put = self
            .bounded("object upload", cancel, self.objects.put(&new_key, Box::pin(reader), staged.content_type()))
            .await;
        let url = match put {
            Ok(Ok(url)) => url,
            Ok(Err(source)) => {
                warn!(%id, %old_key, "old object removed but replacement failed; record is stale");
                return Err(FileError::StorageWriteFailed { key: new_key, source });
            }
            Err(interrupted) => {
                warn!(%id, %old_key, "old object removed but replacement was interrupted; record is stale");
                self.compensate(&new_key).await;
                return Err(interrupted);
            }
        };

        // The old blob is already gone, so the record update proceeds even if
        // the caller has gone away.
        let record = FileRecord {
            id,
            original_name: file_stem(staged.filename()),
            extension: admitted.extension,
            size_bytes: staged.size_bytes(),
            content_type: staged.content_type().to_string(),
            sniffed_content_type: admitted.sniffed_type.to_string(),
            bucket: self.objects.bucket().to_string(),
            object_key: new_key.clone(),
            url,
            version: existing.version + 1,
            updated_at: Utc::now(),
        };

        let update = self
            .committed("metadata update", self.metadata.update(id, &record, existing.version))
            .await;
        let failure = match update {
            Ok(Ok(())) => {
                info!(%id, key = %new_key, version = record.version, "file replaced");
                return Ok(record);
            }
            Ok(Err(MetadataError::NotFound(_))) => FileError::RecordNotFound(id),
            Ok(Err(MetadataError::Conflict { .. })) => {
                // A concurrent replace committed first. When it wrote the same
                // key the blob is shared and cannot be removed; whichever put
                // ran last decides its bytes, so they may not match the
                // winning record.
                let winner = self
                    .committed("metadata lookup", self.metadata.find_by_id(id))
                    .await;
                if matches!(winner, Ok(Ok(ref current)) if current.object_key == new_key) {
                    warn!(%id, key = %new_key, "lost replace race to a writer using the same key");
                    return Err(FileError::Conflict(id));
                }
                FileError::Conflict(id)
            }
            Ok(Err(source)) => FileError::MetadataUpdateFailed { id, source },
            Err(timed_out) => timed_out,
        };

        warn!(%id, key = %new_key, error = %failure, "metadata update failed, removing new object");
        self.compensate(&new_key).await;
        Err(failure)
    }

    /// Remove the blob and then the record. A blob that is already gone is
    /// not an error; a record that is already gone is.
    pub async fn delete(&self, id: Uuid, cancel: &CancellationToken) -> FileResult<()> {
        let record = self.find(id, cancel).await?;

        let key = record.object_key;
        match self.bounded("object delete", cancel, self.objects.delete(&key)).await? {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => debug!(%id, %key, "object already absent"),
            Err(source) => return Err(FileError::StorageDeleteFailed { key, source }),
        }

        match self.committed("metadata delete", self.metadata.delete(id)).await? {
            Ok(()) => {
                info!(%id, %key, "file deleted");
                Ok(())
            }
            Err(MetadataError::NotFound(_)) => Err(FileError::RecordNotFound(id)),
            Err(source) => Err(FileError::MetadataDeleteFailed { id, source }),
        }
    }

    pub async fn get(&self, id: Uuid, cancel: &CancellationToken) -> FileResult<FileRecord> {
        self.find(id, cancel).await
    }

    /// Open a stored blob by object key for streaming back to a client.
    pub async fn open_object(&self, key: &str, cancel: &CancellationToken) -> FileResult<(File, u64)> {
        self.bounded("object read", cancel, self.objects.open(key))
            .await?
            .map_err(|source| FileError::StorageReadFailed {
                key: key.to_string(),
                source,
            })
    }

    pub async fn health(&self) -> StoreHealth {
        let (objects, metadata) = tokio::join!(
            self.committed("object store healthcheck", self.objects.healthcheck()),
            self.committed("metadata healthcheck", self.metadata.healthcheck()),
        );
        StoreHealth {
            objects: flatten_check(objects),
            metadata: flatten_check(metadata),
        }
    }
}

fn flatten_check<E: std::fmt::Display>(check: FileResult<Result<(), E>>) -> Result<(), String> {
    match check {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) => Err(err.to_string()),
    }
}
