use crate::services::file_service::FileService;
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    /// Where multipart bodies are staged while a request is in flight.
    pub staging_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(files: FileService, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            files,
            staging_dir: Arc::new(staging_dir.into()),
        }
    }
}
