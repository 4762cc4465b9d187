//! Shared-secret check applied to every route except the liveness probe.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The pre-shared key clients must present in `Authorization`.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Accepts the bare key or `Bearer <key>`.
    pub fn matches(&self, presented: &str) -> bool {
        let presented = presented.strip_prefix("Bearer ").unwrap_or(presented);
        secure_compare(presented, &self.0)
    }
}

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub async fn require_api_key(State(key): State<ApiKey>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| key.matches(value));

    if !authorized {
        tracing::debug!(path = %request.uri().path(), "rejected request without valid api key");
        return AppError::unauthorized().into_response();
    }
    next.run(request).await
}
