//! Health & readiness handlers.
//!
//! - GET /health          -> liveness ("ok"), no authentication
//! - GET /api/v1/readyz   -> readiness of the object store and metadata store

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /health`
///
/// Liveness probe. Performs no I/O and is reachable without the API key.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /api/v1/readyz`
///
/// Runs both stores' health checks concurrently. HTTP 200 when all checks
/// pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.files.health().await;
    let overall_ok = health.objects.is_ok() && health.metadata.is_ok();

    let mut checks = HashMap::new();
    checks.insert("object_store", check_status("object_store", health.objects));
    checks.insert("metadata_store", check_status("metadata_store", health.metadata));

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Failure detail goes to the log; the response only says the check failed.
fn check_status(name: &str, result: Result<(), String>) -> CheckStatus {
    match result {
        Ok(()) => CheckStatus { ok: true, error: None },
        Err(detail) => {
            tracing::error!(check = name, error = %detail, "readiness check failed");
            CheckStatus {
                ok: false,
                error: Some("unavailable"),
            }
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<&'static str>,
}
