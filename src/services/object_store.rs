//! src/services/object_store.rs
//!
//! Blob storage behind the [`ObjectStore`] trait. [`LocalObjectStore`] keeps
//! payloads on disk sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`
//! and hands out URLs served by the ingress layer.

use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use tempfile::TempPath;
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed byte source handed to [`ObjectStore::put`].
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Durable blob storage keyed by object name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Container name recorded alongside each file.
    fn bucket(&self) -> &str;

    /// Store `body` under `key`, replacing any existing object, and return the
    /// URL the blob can be fetched from.
    async fn put(&self, key: &str, body: BlobReader, content_type: &str) -> StoreResult<String>;

    /// Remove the object. Returns [`StoreError::NotFound`] when nothing was
    /// stored under `key`.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Open the object for reading, returning the handle and its length.
    async fn open(&self, key: &str) -> StoreResult<(File, u64)>;

    async fn healthcheck(&self) -> StoreResult<()>;
}

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// On-disk object store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    base_path: PathBuf,
    bucket: String,
    public_base_url: String,
}

impl LocalObjectStore {
    /// Create the store, making sure the bucket directory exists.
    pub async fn new(
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> StoreResult<Self> {
        let store = Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into(),
        };
        let root = store.bucket_root();
        if !fs::try_exists(&root).await? {
            fs::create_dir_all(&root).await?;
            info!("Created bucket directory at {}", root.display());
        }
        Ok(store)
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard directories from MD5(bucket/key), as lowercase hex.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/api/v1/objects/{}",
            self.public_base_url.trim_end_matches('/'),
            key
        )
    }

    /// Walk up from `start` removing empty directories until `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Writes to a temporary sibling, fsyncs, then renames into place so a
    /// reader never observes a partial object.
    async fn put(&self, key: &str, mut body: BlobReader, _content_type: &str) -> StoreResult<String> {
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        // Removed on drop unless the rename below succeeds, including when
        // this future is dropped mid-write.
        let tmp_path = TempPath::from_path(parent.join(format!(".tmp-{}", Uuid::new_v4())));

        let mut file = File::create(&tmp_path).await?;
        let size_bytes = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &file_path).await?;
        let _ = tmp_path.keep();

        debug!(key, size_bytes, path = %file_path.display(), "stored object");
        Ok(self.object_url(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Self::ensure_key_safe(key)?;
        Ok(fs::try_exists(self.object_path(key)).await?)
    }

    async fn open(&self, key: &str) -> StoreResult<(File, u64)> {
        Self::ensure_key_safe(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Best-effort write/read/delete probe under the bucket root.
    async fn healthcheck(&self) -> StoreResult<()> {
        let probe = self.bucket_root().join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        match read_back {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err(StoreError::Unavailable("probe content mismatch".into())),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn store(dir: &Path) -> LocalObjectStore {
        LocalObjectStore::new(dir, "user-uploads", "http://localhost:8080/")
            .await
            .unwrap()
    }

    fn body(data: &'static [u8]) -> BlobReader {
        Box::pin(data)
    }

    #[tokio::test]
    async fn put_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let url = store.put("abc.png", body(b"payload"), "image/png").await.unwrap();
        assert_eq!(url, "http://localhost:8080/api/v1/objects/abc.png");
        assert!(store.exists("abc.png").await.unwrap());

        let (mut file, len) = store.open("abc.png").await.unwrap();
        assert_eq!(len, 7);
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");

        store.delete("abc.png").await.unwrap();
        assert!(!store.exists("abc.png").await.unwrap());
        assert!(matches!(
            store.delete("abc.png").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_prunes_shard_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.put("abc.png", body(b"x"), "image/png").await.unwrap();
        store.delete("abc.png").await.unwrap();

        let mut entries = fs::read_dir(dir.path().join("user-uploads")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        for key in ["", "/etc/passwd", "../escape.png", "a\\b.png"] {
            assert!(matches!(
                store.put(key, body(b"x"), "image/png").await,
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn healthcheck_leaves_no_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.healthcheck().await.unwrap();
        let mut entries = fs::read_dir(dir.path().join("user-uploads")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
