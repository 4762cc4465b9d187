//! Represents a stored file's metadata document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata describing one stored file.
///
/// A record exists exactly when a blob exists in the object store under
/// `bucket`/`object_key`. The blob itself is never held here.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Identifier assigned at upload; never changes.
    pub id: Uuid,

    /// Client-supplied filename with its extension stripped.
    pub original_name: String,

    /// Lowercase extension of the current version, including the leading dot.
    pub extension: String,

    /// Size in bytes of the current version.
    pub size_bytes: i64,

    /// Content type declared by the client.
    pub content_type: String,

    /// Content type detected from the payload at admission.
    pub sniffed_content_type: String,

    /// Object store container holding the blob.
    pub bucket: String,

    /// Object key, always `id` followed by `extension`.
    pub object_key: String,

    /// Locator for retrieving the blob.
    pub url: String,

    /// Incremented on every replace; used for conditional updates.
    pub version: i64,

    /// When the record was created or last replaced.
    pub updated_at: DateTime<Utc>,
}

/// Object key for a file: its identifier followed by its extension.
pub fn object_key(id: Uuid, extension: &str) -> String {
    format!("{id}{extension}")
}
