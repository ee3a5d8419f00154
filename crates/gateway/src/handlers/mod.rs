//! HTTP handlers and request middleware

pub mod admin;
pub mod health;
pub mod proxy;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use genapi_common::{hash_api_key, verify_api_key};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Correlation id assigned to every incoming request
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Extract the credential from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Assign a request id, time the request, and count it in the gateway
/// metrics
pub async fn track_requests(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;

    let elapsed = started.elapsed();
    let process_time_ms = elapsed.as_secs_f64() * 1000.0;
    let status = response.status().as_u16();
    state.metrics.record(elapsed, status);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", process_time_ms)) {
        headers.insert(PROCESS_TIME_HEADER, value);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        process_time_ms,
        "Request processed"
    );

    response
}

/// Reject admin calls without the administrative bearer credential
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return ApiError::unauthorized("Missing admin credentials").into_response();
    };

    if !verify_api_key(token, &hash_api_key(&state.config.admin_api_key)) {
        warn!(path = %req.uri().path(), "Rejected admin request with invalid credentials");
        return ApiError::unauthorized("Invalid admin credentials").into_response();
    }

    next.run(req).await
}
