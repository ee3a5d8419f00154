//! Generated-API Gateway
//!
//! Single HTTP entry point in front of every generated API. Each call is
//! authenticated against the [`ApiRegistry`], counted by the
//! [`RateLimiter`], routed to the API's isolated deployment (deployed on
//! first use by the [`Orchestrator`]), and relayed back unchanged.
//!
//! ## Endpoints
//!
//! - `ANY /run/{api_id}/{path}` - Call a generated API (`Authorization: Bearer <api_key>`)
//! - `GET /health` - Health check
//! - `GET /` - Service info
//! - `GET /metrics` - Gateway counters (admin)
//! - `GET /metrics/prometheus` - Prometheus text exposition (admin)
//! - `GET /admin/deployments` - List deployments (admin)
//! - `GET /admin/deployment/{api_id}` - Deployment diagnostics (admin)
//! - `POST /admin/deployment/{api_id}/start` - Deploy now (admin)
//! - `POST /admin/deployment/{api_id}/stop` - Stop a deployment (admin)
//! - `POST /admin/reload/{api_id}` - Reload one API (admin)
//! - `POST /admin/reload` - Reload every API (admin)
//! - `POST /admin/cleanup` - Sweep orphaned and crashed containers (admin)
//! - `GET /admin/rate-limit/{owner_id}` - Owner budget status (admin)

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod translate;
pub mod usage;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{any, get, post},
    Router,
};
use genapi_common::{ArtifactStore, RecordStore};
use genapi_orchestrator::Orchestrator;
use genapi_ratelimit::RateLimiter;
use genapi_registry::ApiRegistry;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::GatewayConfig;
pub use error::ApiError;
pub use metrics::Metrics;
pub use usage::UsageRecorder;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ApiRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub limiter: Arc<RateLimiter>,
    pub records: Arc<dyn RecordStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub usage: UsageRecorder,
    pub metrics: Arc<Metrics>,

    /// Client for forwarding to deployments
    pub http: reqwest::Client,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: GatewayConfig,
        registry: Arc<ApiRegistry>,
        orchestrator: Arc<Orchestrator>,
        limiter: Arc<RateLimiter>,
        records: Arc<dyn RecordStore>,
        artifacts: Arc<dyn ArtifactStore>,
        usage: UsageRecorder,
    ) -> Result<Self> {
        // No idle pooling: a deployment can be replaced on the same port
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .context("Failed to build forwarding client")?;

        Ok(Self {
            config: Arc::new(config),
            registry,
            orchestrator,
            limiter,
            records,
            artifacts,
            usage,
            metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
            http,
        })
    }
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    let state = Arc::new(state);

    let admin = Router::new()
        .route("/metrics", get(handlers::admin::metrics_handler))
        .route(
            "/metrics/prometheus",
            get(handlers::admin::prometheus_metrics_handler),
        )
        .route(
            "/admin/deployments",
            get(handlers::admin::list_deployments_handler),
        )
        .route(
            "/admin/deployment/{api_id}",
            get(handlers::admin::deployment_handler),
        )
        .route(
            "/admin/deployment/{api_id}/start",
            post(handlers::admin::start_handler),
        )
        .route(
            "/admin/deployment/{api_id}/stop",
            post(handlers::admin::stop_handler),
        )
        .route("/admin/reload", post(handlers::admin::reload_all_handler))
        .route(
            "/admin/reload/{api_id}",
            post(handlers::admin::reload_handler),
        )
        .route("/admin/cleanup", post(handlers::admin::cleanup_handler))
        .route(
            "/admin/rate-limit/{owner_id}",
            get(handlers::admin::rate_limit_status_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_admin,
        ));

    Router::new()
        // Health check
        .route("/", get(handlers::health::root_handler))
        .route("/health", get(handlers::health::health_handler))
        // Generated API calls
        .route("/run/{api_id}", any(handlers::proxy::proxy_root_handler))
        .route("/run/{api_id}/", any(handlers::proxy::proxy_root_handler))
        .route(
            "/run/{api_id}/{*path}",
            any(handlers::proxy::proxy_path_handler),
        )
        // Operations
        .merge(admin)
        // Middleware
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::track_requests,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
