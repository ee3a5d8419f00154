//! `/run/{api_id}/{path}` pipeline
//!
//! authenticate -> rate-limit -> read body -> lease (cold deploy if needed)
//! -> forward -> relay -> record usage

use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use genapi_common::{verify_api_key, UsageRecord};
use genapi_orchestrator::DeploymentLease;
use genapi_ratelimit::{RateDecision, RateLimitError};
use genapi_registry::RegistryEntry;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::{bearer_token, RequestId};
use crate::translate::{self, ForwardBody};
use crate::AppState;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Call an API at its root path
pub async fn proxy_root_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
    req: Request,
) -> Response {
    proxy(state, api_id, req).await
}

/// Call an API at a sub-path
pub async fn proxy_path_handler(
    State(state): State<Arc<AppState>>,
    Path((api_id, _)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy(state, api_id, req).await
}

/// Sub-path of `/run/{api_id}/{path}` exactly as the caller encoded it
fn raw_subpath(request_path: &str) -> &str {
    let rest = request_path
        .strip_prefix("/run/")
        .unwrap_or(request_path)
        .trim_start_matches('/');

    match rest.split_once('/') {
        Some((_, subpath)) => subpath,
        None => "",
    }
}

/// Caller request after body decoding
struct Outbound {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: ForwardBody,
}

impl Outbound {
    fn url(&self, port: u16) -> String {
        let path = self.path.trim_start_matches('/');
        match &self.query {
            Some(query) => format!("http://127.0.0.1:{}/{}?{}", port, path, query),
            None => format!("http://127.0.0.1:{}/{}", port, path),
        }
    }
}

async fn proxy(state: Arc<AppState>, api_id: String, req: Request) -> Response {
    let started = Instant::now();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let entry = match authenticate(&state, &api_id, req.headers()) {
        Ok(entry) => entry,
        Err(e) => return e.into_response(),
    };

    let decision = match admit(&state, &entry).await {
        Ok(decision) => decision,
        Err(rejection) => return rejection,
    };

    let path = raw_subpath(req.uri().path()).to_string();
    let (mut response, request_bytes) = match read_request(&state, path, req).await {
        Ok(outbound) => {
            let request_bytes = outbound.body.len();
            let response = forward(&state, &api_id, &outbound)
                .await
                .unwrap_or_else(IntoResponse::into_response);
            (response, request_bytes)
        }
        Err(e) => (e.into_response(), 0),
    };

    apply_rate_headers(response.headers_mut(), &decision);

    state.usage.record(UsageRecord {
        api_id: api_id.clone(),
        owner_id: entry.owner_id.clone(),
        request_id,
        status_code: response.status().as_u16(),
        latency_ms: started.elapsed().as_millis() as u64,
        request_bytes,
        recorded_at: Utc::now(),
    });

    response
}

fn authenticate(
    state: &AppState,
    api_id: &str,
    headers: &HeaderMap,
) -> Result<Arc<RegistryEntry>, ApiError> {
    let Some(api_key) = bearer_token(headers) else {
        return Err(ApiError::unauthorized(
            "Missing API key. Use 'Authorization: Bearer <api_key>'",
        ));
    };

    match state.registry.get(api_id) {
        Some(entry) if verify_api_key(api_key, &entry.api_key_hash) => Ok(entry),
        _ => {
            debug!(api_id = %api_id, "Authentication failed");
            Err(ApiError::unauthorized("Invalid API key or API not found"))
        }
    }
}

async fn admit(state: &AppState, entry: &RegistryEntry) -> Result<RateDecision, Response> {
    match state
        .limiter
        .check(&entry.owner_id, entry.plan, entry.custom_rate_limit)
        .await
    {
        Ok(decision) => Ok(decision),
        Err(RateLimitError::Exceeded(decision)) => {
            info!(
                api_id = %entry.api_id,
                owner_id = %entry.owner_id,
                limit = decision.limit,
                "Rate limit exceeded"
            );
            Err(rate_limited(&decision))
        }
        Err(e @ RateLimitError::Store(_)) => {
            error!(owner_id = %entry.owner_id, "Rejecting request: {}", e);
            Err(ApiError::unavailable("Rate limiter unavailable").into_response())
        }
    }
}

fn rate_limited(decision: &RateDecision) -> Response {
    let body = serde_json::json!({
        "error": format!(
            "Rate limit exceeded. Limit: {} requests per window",
            decision.limit
        ),
        "limit": decision.limit,
        "reset": decision.reset_at,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_rate_headers(headers, decision);
    headers.insert(
        header::RETRY_AFTER,
        HeaderValue::from(decision.retry_after_secs(Utc::now())),
    );
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(decision.reset_at));
}

async fn read_request(state: &AppState, path: String, req: Request) -> Result<Outbound, ApiError> {
    let method = req.method().clone();
    let query = req.uri().query().map(str::to_string);
    let multipart = translate::is_multipart(req.headers());
    let headers = translate::forward_headers(req.headers(), multipart);

    let body = if multipart {
        let form = Multipart::from_request(req, state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        ForwardBody::Multipart(translate::decode_multipart(form).await?)
    } else {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        ForwardBody::Raw(bytes)
    };

    Ok(Outbound {
        method,
        path,
        query,
        headers,
        body,
    })
}

/// Forward with one redeploy-and-retry on connection failure
async fn forward(state: &AppState, api_id: &str, outbound: &Outbound) -> Result<Response, ApiError> {
    let lease = acquire(state, api_id).await?;

    let failure = match send(state, &lease, outbound).await {
        Ok(upstream) => return Ok(relay(upstream, lease)),
        Err(e) if e.is_timeout() => return Err(upstream_timeout(api_id, state)),
        Err(e) => e,
    };

    warn!(api_id = %api_id, "Forwarding failed, redeploying: {}", failure);
    release_unreachable(state, api_id, lease, &failure);

    let lease = acquire(state, api_id).await?;
    match send(state, &lease, outbound).await {
        Ok(upstream) => Ok(relay(upstream, lease)),
        Err(e) if e.is_timeout() => Err(upstream_timeout(api_id, state)),
        Err(e) => {
            error!(api_id = %api_id, "Forwarding failed after redeploy: {}", e);
            release_unreachable(state, api_id, lease, &e);
            Err(ApiError::unavailable("API unavailable, please retry"))
        }
    }
}

/// Running deployment, deploying it first when needed
async fn acquire(state: &AppState, api_id: &str) -> Result<DeploymentLease, ApiError> {
    if let Some(lease) = state.orchestrator.lease(api_id).await {
        return Ok(lease);
    }

    let artifact = state
        .artifacts
        .fetch_artifact(api_id)
        .await
        .map_err(|e| {
            error!(api_id = %api_id, "Failed to fetch artifact: {}", e);
            ApiError::unavailable("API code unavailable")
        })?
        .ok_or_else(|| ApiError::not_found("API code not found"))?;

    info!(api_id = %api_id, "Deploying on demand");
    if let Err(e) = state.orchestrator.deploy(api_id, &artifact).await {
        error!(api_id = %api_id, "On-demand deployment failed: {}", e);
        return Err(ApiError::unavailable("API failed to start"));
    }

    state
        .orchestrator
        .lease(api_id)
        .await
        .ok_or_else(|| ApiError::unavailable("API unavailable, please retry"))
}

async fn send(
    state: &AppState,
    lease: &DeploymentLease,
    outbound: &Outbound,
) -> reqwest::Result<reqwest::Response> {
    let request = state
        .http
        .request(outbound.method.clone(), outbound.url(lease.port()))
        .headers(outbound.headers.clone())
        .timeout(state.config.forward_timeout);

    outbound.body.attach(request).send().await
}

/// Drop the lease and flag the deployment, unless it was already replaced
fn release_unreachable(
    state: &AppState,
    api_id: &str,
    lease: DeploymentLease,
    err: &reqwest::Error,
) {
    let failed_container = lease.handle.container_id.clone();
    drop(lease);

    let current = state
        .registry
        .get(api_id)
        .and_then(|entry| entry.deployment.clone());

    if current.is_some_and(|handle| handle.is_running() && handle.container_id == failed_container)
    {
        state.orchestrator.report_unreachable(api_id, &err.to_string());
    }
}

fn upstream_timeout(api_id: &str, state: &AppState) -> ApiError {
    warn!(
        api_id = %api_id,
        "Upstream did not answer within {}s",
        state.config.forward_timeout.as_secs_f64()
    );
    ApiError::new(StatusCode::GATEWAY_TIMEOUT, "API request timed out")
}

/// Stream the deployment's response back, holding the lease until the body
/// is fully sent
fn relay(upstream: reqwest::Response, lease: DeploymentLease) -> Response {
    let status = upstream.status();
    let headers = translate::relay_headers(upstream.headers());

    let body = upstream.bytes_stream().map(move |chunk| {
        let _held = &lease;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
