//! Defines routes for the file storage API.
//!
//! ## Structure
//! - `GET    /health`                - liveness probe (no authentication)
//! - `POST   /api/v1/upload`         - upload a file (multipart field `file`)
//! - `GET    /api/v1/files/{id}`     - fetch a file's metadata
//! - `PUT    /api/v1/files/{id}`     - replace a file's content
//! - `DELETE /api/v1/files/{id}`     - delete a file
//! - `GET    /api/v1/objects/{*key}` - download a stored blob
//! - `GET    /api/v1/readyz`         - readiness of both stores
//!
//! Everything under `/api/v1` requires the shared API key.

use crate::{
    handlers::{
        file_handlers::{delete_file, get_file, get_object, replace_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    middleware::auth::{ApiKey, require_api_key},
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

/// Build the router with shared state applied.
///
/// `max_body_bytes` caps request bodies before any handler sees them.
pub fn routes(state: AppState, api_key: ApiKey, max_body_bytes: usize) -> Router {
    let api = Router::new()
        .route("/upload", post(upload_file))
        .route(
            "/files/{id}",
            get(get_file).put(replace_file).delete(delete_file),
        )
        .route("/objects/{*key}", get(get_object))
        .route("/readyz", get(readyz))
        .layer(middleware::from_fn_with_state(api_key, require_api_key));

    Router::new()
        .route("/health", get(healthz))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
