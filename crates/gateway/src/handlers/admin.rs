//! Administrative endpoints
//!
//! Every route here sits behind [`crate::handlers::require_admin`]. Errors
//! carry orchestrator detail, unlike the caller-facing proxy.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use genapi_common::{ApiRecord, Artifact};
use genapi_orchestrator::{DeploymentSummary, Diagnostics, SweepReport};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::metrics::MetricsSnapshot;
use crate::AppState;

/// Deployment listing
#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<DeploymentSummary>,
    pub count: usize,
}

/// Result of a bulk reload
#[derive(Debug, Serialize)]
pub struct ReloadAllResponse {
    pub loaded: usize,
    pub restarted: usize,
    pub failed: Vec<String>,
    pub stopped: Vec<String>,
}

/// Budget state of one owner
#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub owner_id: String,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub deployed_apis: usize,
    pub registered_apis: usize,
}

/// Gateway counters
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: state.metrics.snapshot(),
        deployed_apis: state.registry.running_count(),
        registered_apis: state.registry.len(),
    })
}

/// Gateway collectors in Prometheus text format
pub async fn prometheus_metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    state
        .metrics
        .set_api_counts(state.registry.running_count(), state.registry.len());

    let body = state.metrics.render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
    })?;

    Ok(([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response())
}

/// List every deployment the orchestrator tracks
pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
) -> Json<DeploymentsResponse> {
    let deployments = state.orchestrator.list();
    Json(DeploymentsResponse {
        count: deployments.len(),
        deployments,
    })
}

/// Health, last error, and recent logs of one deployment
pub async fn deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<Diagnostics>, ApiError> {
    if !state.registry.contains(&api_id) && state.orchestrator.record(&api_id).is_none() {
        return Err(ApiError::not_found(format!("API {} not found", api_id)));
    }

    let diagnostics = state
        .orchestrator
        .diagnostics(&api_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;

    Ok(Json(diagnostics))
}

/// Deploy an active API now
pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = active_record(&state, &api_id).await?;
    state.registry.upsert_record(&record);

    let artifact = artifact_for(&state, &api_id).await?;
    let handle = state
        .orchestrator
        .deploy(&api_id, &artifact)
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;

    info!(api_id = %api_id, port = handle.port, "Deployment started by admin");
    Ok(Json(json!({
        "api_id": api_id,
        "status": "started",
        "deployment": handle,
    })))
}

/// Stop a deployment; the API stays registered and redeploys on demand
pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stopped = state
        .orchestrator
        .stop(&api_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;

    Ok(Json(json!({
        "api_id": api_id,
        "status": if stopped { "stopped" } else { "not_running" },
    })))
}

/// Re-read one API's record and rebuild its deployment.
///
/// A deleted record drops the API; a paused one is unloaded and stopped.
pub async fn reload_handler(
    State(state): State<Arc<AppState>>,
    Path(api_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.records.get_record(&api_id).await?;

    let Some(record) = record else {
        unload(&state, &api_id).await?;
        return Err(ApiError::not_found(format!("API {} not found", api_id)));
    };

    if !record.is_active() {
        unload(&state, &api_id).await?;
        info!(api_id = %api_id, "Paused API unloaded");
        return Ok(Json(json!({
            "api_id": api_id,
            "status": "unloaded",
        })));
    }

    state.registry.upsert_record(&record);
    let artifact = artifact_for(&state, &api_id).await?;
    let handle = state
        .orchestrator
        .restart(&api_id, &artifact)
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;

    info!(api_id = %api_id, version = %handle.artifact_version, "API reloaded");
    Ok(Json(json!({
        "api_id": api_id,
        "status": "reloaded",
        "deployment": handle,
    })))
}

/// Reload the whole registry and restart every active API
pub async fn reload_all_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadAllResponse>, ApiError> {
    let loaded = state.registry.load_all(state.records.as_ref()).await?;

    let mut stopped = Vec::new();
    for summary in state.orchestrator.list() {
        if state.registry.contains(&summary.api_id) {
            continue;
        }
        match state.orchestrator.stop(&summary.api_id).await {
            Ok(true) => stopped.push(summary.api_id),
            Ok(false) => {}
            Err(e) => warn!(api_id = %summary.api_id, "Failed to stop unloaded API: {}", e),
        }
    }

    let mut api_ids: Vec<String> = state.registry.snapshot().keys().cloned().collect();
    api_ids.sort();

    let mut restarted = 0;
    let mut failed = Vec::new();
    for api_id in api_ids {
        let outcome = match artifact_for(&state, &api_id).await {
            Ok(artifact) => state
                .orchestrator
                .restart(&api_id, &artifact)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.message),
        };

        match outcome {
            Ok(()) => restarted += 1,
            Err(reason) => {
                error!(api_id = %api_id, "Reload failed: {}", reason);
                failed.push(api_id);
            }
        }
    }

    info!(
        "Reloaded {} APIs: {} restarted, {} failed, {} stopped",
        loaded,
        restarted,
        failed.len(),
        stopped.len()
    );

    Ok(Json(ReloadAllResponse {
        loaded,
        restarted,
        failed,
        stopped,
    }))
}

/// Remove orphaned containers and reap crashed deployments
pub async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state
        .orchestrator
        .sweep()
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;

    Ok(Json(report))
}

/// Current window usage for an owner, without counting a request
pub async fn rate_limit_status_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Result<Json<RateLimitStatusResponse>, ApiError> {
    let entry = state
        .registry
        .find_by_owner(&owner_id)
        .ok_or_else(|| ApiError::not_found(format!("No APIs loaded for owner {}", owner_id)))?;

    let decision = state
        .limiter
        .status(&owner_id, entry.plan, entry.custom_rate_limit)
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;

    Ok(Json(RateLimitStatusResponse {
        owner_id,
        limit: decision.limit,
        used: decision.used,
        remaining: decision.remaining,
        reset: decision.reset_at,
    }))
}

async fn active_record(state: &AppState, api_id: &str) -> Result<ApiRecord, ApiError> {
    let record = state
        .records
        .get_record(api_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("API {} not found", api_id)))?;

    if !record.is_active() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("API {} is paused", api_id),
        ));
    }

    Ok(record)
}

async fn artifact_for(state: &AppState, api_id: &str) -> Result<Artifact, ApiError> {
    state
        .artifacts
        .fetch_artifact(api_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Code for API {} not found", api_id)))
}

async fn unload(state: &AppState, api_id: &str) -> Result<(), ApiError> {
    state.registry.remove(api_id);
    state
        .orchestrator
        .stop(api_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(&e))?;
    Ok(())
}
