//! src/services/staging.rs
//!
//! Request-scoped staging of uploaded payloads.
//!
//! Multipart bodies are streamed into a temporary file so the validator can
//! sniff and rewind them and the object store can read them back. The file is
//! owned by a [`StagedFile`] and removed when it is dropped, whichever path the
//! request takes out of the handler.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{io, path::Path};
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;

/// An uploaded file staged on local disk.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    filename: String,
    content_type: String,
    size_bytes: i64,
}

impl StagedFile {
    /// Stream `body` into a fresh temporary file under `dir`.
    ///
    /// The partially written file is removed if the stream or a write fails.
    pub async fn stage<S>(
        dir: &Path,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        body: S,
    ) -> io::Result<Self>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        fs::create_dir_all(dir).await?;
        let path = tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(dir)?
            .into_temp_path();

        let mut file = File::create(&path).await?;
        let mut size_bytes: i64 = 0;
        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(path = %path.display(), size_bytes, "staged upload");

        Ok(Self {
            path,
            filename: filename.into(),
            content_type: content_type.into(),
            size_bytes,
        })
    }

    /// Stage an in-memory payload.
    pub async fn from_bytes(
        dir: &Path,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> io::Result<Self> {
        let chunk: io::Result<Bytes> = Ok(data.into());
        Self::stage(dir, filename, content_type, futures::stream::iter([chunk])).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name supplied by the client, including its extension.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Content type declared by the client.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    /// Open a fresh read handle positioned at the start of the payload.
    pub async fn open(&self) -> io::Result<File> {
        File::open(&self.path).await
    }
}
