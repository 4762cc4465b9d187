//! HTTP handlers for file operations.
//! Stages multipart bodies to a request-scoped temporary file and delegates
//! admission and storage to `FileService`.

use crate::{
    errors::AppError,
    models::file_record::FileRecord,
    services::{
        file_service::FileResult,
        staging::StagedFile,
        validator::{content_type_for_extension, file_extension},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, State,
        multipart::MultipartError,
    },
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{future::Future, io, path::Path as FsPath};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Body returned by upload, replace and delete.
#[derive(Debug, Serialize, Deserialize)]
pub struct UrlResponse {
    pub url: String,
}

const FILE_FIELD: &str = "file";

/// Run `work` on its own task. The token is cancelled if this handler's
/// future is dropped (client disconnect), letting the service stop at its
/// next store call and undo what it already wrote.
async fn detached<T, F, Fut>(fallback: &'static str, work: F) -> Result<T, AppError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = FileResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let _disconnect_guard = cancel.clone().drop_guard();
    match tokio::spawn(work(cancel)).await {
        Ok(result) => result.map_err(|err| AppError::from_file_error(err, fallback)),
        Err(join_err) => {
            error!(error = %join_err, "file task failed");
            Err(AppError::internal(fallback))
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request("Invalid file ID format"))
}

/// Oversized bodies are reported as such; anything else is a malformed form.
fn multipart_rejection(err: &MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %err, "upload exceeds body limit");
        AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "File too large")
    } else {
        warn!(error = %err, "malformed multipart body");
        AppError::bad_request("File upload error")
    }
}

/// Pull the `file` field out of the form and stage it to disk.
async fn stage_file_field(staging_dir: &FsPath, multipart: &mut Multipart) -> Result<StagedFile, AppError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                warn!("multipart body has no `{}` field", FILE_FIELD);
                return Err(AppError::bad_request("File upload error"));
            }
            Err(err) => return Err(multipart_rejection(&err)),
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = field.map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)));

        return match StagedFile::stage(staging_dir, filename, content_type, body).await {
            Ok(staged) => Ok(staged),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                match err.get_ref().and_then(|inner| inner.downcast_ref::<MultipartError>()) {
                    Some(multipart_err) => Err(multipart_rejection(multipart_err)),
                    None => {
                        warn!(error = %err, "failed to read upload body");
                        Err(AppError::bad_request("File upload error"))
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "failed to stage upload");
                Err(AppError::internal("Failed to process file"))
            }
        };
    }
}

/// `POST /api/v1/upload`
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UrlResponse>, AppError> {
    let staged = stage_file_field(&state.staging_dir, &mut multipart).await?;
    info!(
        filename = staged.filename(),
        size_bytes = staged.size_bytes(),
        content_type = staged.content_type(),
        "upload attempt"
    );

    let files = state.files.clone();
    let record = detached("Failed to process file", move |cancel| async move {
        files.upload(&staged, &cancel).await
    })
    .await?;

    Ok(Json(UrlResponse { url: record.url }))
}

/// `GET /api/v1/files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileRecord>, AppError> {
    let id = parse_id(&id)?;
    let files = state.files.clone();
    let record = detached("Failed to get file metadata", move |cancel| async move {
        files.get(id, &cancel).await
    })
    .await?;
    Ok(Json(record))
}

/// `PUT /api/v1/files/{id}`
pub async fn replace_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UrlResponse>, AppError> {
    let id = parse_id(&id)?;
    let staged = stage_file_field(&state.staging_dir, &mut multipart).await?;
    info!(
        %id,
        filename = staged.filename(),
        size_bytes = staged.size_bytes(),
        "replace attempt"
    );

    let files = state.files.clone();
    let record = detached("Failed to replace file", move |cancel| async move {
        files.replace(id, &staged, &cancel).await
    })
    .await?;

    Ok(Json(UrlResponse { url: record.url }))
}

/// `DELETE /api/v1/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UrlResponse>, AppError> {
    let id = parse_id(&id)?;
    let files = state.files.clone();
    detached("Failed to delete file", move |cancel| async move {
        files.delete(id, &cancel).await
    })
    .await?;

    Ok(Json(UrlResponse {
        url: format!("File {} deleted", id),
    }))
}

/// `GET /api/v1/objects/{*key}` - stream a stored blob.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let files = state.files.clone();
    let lookup_key = key.clone();
    let (file, len) = detached("Failed to read file", move |cancel| async move {
        files.open_object(&lookup_key, &cancel).await
    })
    .await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    let content_type = content_type_for_extension(&file_extension(&key)).unwrap_or("application/octet-stream");
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}
