//! Data models for the file storage service.
//!
//! Entities map to database rows via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod file_record;
