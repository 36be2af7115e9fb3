//! Optional shared-secret check for `/api/*` routes.
//!
//! When `SECRET_KEY` is set, requests must carry it either as
//! `Authorization: Bearer <key>` or in the `X-Api-Key` header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::routes::ApiError;

/// Reject requests that do not present the configured key.
pub async fn require_api_key(
    State(expected): State<Option<Arc<str>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected else {
        return next.run(request).await;
    };

    let rejection = match presented_key(request.headers()) {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => None,
        Some(_) => Some("Invalid API key"),
        None => Some("Missing API key"),
    };

    match rejection {
        None => next.run(request).await,
        Some(reason) => ApiError::new(StatusCode::UNAUTHORIZED, reason).into_response(),
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    bearer.or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
