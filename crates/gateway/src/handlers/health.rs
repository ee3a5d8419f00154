//! Unauthenticated status endpoints

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::AppState;

pub const SERVICE_NAME: &str = "genapi-gateway";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub persistence: &'static str,
    pub deployed_apis: usize,
    pub registered_apis: usize,
    pub timestamp: String,
}

/// Health check endpoint
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, persistence) = match state.records.ping().await {
        Ok(()) => ("healthy", "connected"),
        Err(e) => {
            warn!("Persistence health check failed: {}", e);
            ("degraded", "disconnected")
        }
    };

    Json(HealthResponse {
        status,
        service: SERVICE_NAME,
        persistence,
        deployed_apis: state.registry.running_count(),
        registered_apis: state.registry.len(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Service banner
pub async fn root_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "running",
        "environment": state.config.environment,
        "deployed_apis": state.registry.running_count(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
