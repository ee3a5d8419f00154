//! Generated-API Gateway Service
//!
//! Loads the registry, connects the container runtime, and serves the
//! gateway until interrupted.

use anyhow::{Context, Result};
use genapi_common::{ArtifactStore, RecordStore, RedisStore, UsageSink};
use genapi_gateway::config::CounterBackend;
use genapi_gateway::{create_router, usage, AppState, GatewayConfig, UsageRecorder};
use genapi_orchestrator::{DockerRuntime, Orchestrator, OrchestratorConfig};
use genapi_ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};
use genapi_registry::ApiRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_FILTER: &str = "genapi_gateway=debug,genapi_orchestrator=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = GatewayConfig::from_env().context("Failed to load configuration")?;
    let orchestrator_config =
        OrchestratorConfig::from_env().context("Failed to load deployment configuration")?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Generated-API Gateway");
    info!("  Environment: {}", config.environment);
    info!("  Redis URL: {}", config.redis_url);
    info!("  Rate limit backend: {:?}", config.counter_backend);
    info!(
        "  Deployment ports: {}..{}",
        orchestrator_config.base_port,
        u32::from(orchestrator_config.base_port) + u32::from(orchestrator_config.port_range)
    );

    // Persistence
    let store = Arc::new(
        RedisStore::new(&config.redis_url)
            .await
            .context("Failed to connect to persistence")?,
    );
    let records: Arc<dyn RecordStore> = store.clone();
    let artifacts: Arc<dyn ArtifactStore> = store.clone();
    let usage_sink: Arc<dyn UsageSink> = store;

    // Rate limiter
    let counters: Arc<dyn CounterStore> = match config.counter_backend {
        CounterBackend::Redis => Arc::new(
            RedisCounterStore::new(&config.redis_url)
                .await
                .context("Failed to connect rate limiter to Redis")?,
        ),
        CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
    };
    let limiter = Arc::new(RateLimiter::new(counters, config.rate_limit.clone()));

    // Registry
    let registry = Arc::new(ApiRegistry::new());
    let loaded = registry
        .load_all(records.as_ref())
        .await
        .context("Failed to load API registry")?;
    info!("Registry loaded with {} active APIs", loaded);

    // Container runtime
    let runtime = DockerRuntime::connect(orchestrator_config.docker_host.as_deref())
        .context("Failed to connect to container runtime")?;
    runtime
        .ping()
        .await
        .context("Container runtime is not reachable")?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(runtime),
        registry.clone(),
        orchestrator_config,
    ));

    // Usage worker
    let (recorder, usage_worker) = UsageRecorder::spawn(usage_sink, config.usage_queue_capacity);

    // Background maintenance
    let sweeper = orchestrator.spawn_sweeper(config.sweep_interval);
    if config.eager_deploy {
        spawn_eager_deploy(registry.clone(), orchestrator.clone(), artifacts.clone());
    }

    let api_address = config.api_address();
    let state = AppState::new(
        config,
        registry,
        orchestrator,
        limiter,
        records,
        artifacts,
        recorder,
    )?;

    // Create router
    let app = create_router(state);

    // Start server
    let listener = TcpListener::bind(&api_address)
        .await
        .with_context(|| format!("Failed to bind to {}", api_address))?;

    info!("Gateway listening on {}", api_address);
    info!("Health check: http://{}/health", api_address);
    info!("Endpoints:");
    info!("  ANY /run/{{api_id}}/{{path}} - Call a generated API");
    info!("  GET /metrics - Gateway metrics (admin)");
    info!("  GET /admin/deployments - List deployments (admin)");
    info!("  POST /admin/reload/{{api_id}} - Reload an API (admin)");
    info!("  POST /admin/cleanup - Sweep containers (admin)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down Generated-API Gateway");
    sweeper.abort();

    // The router and its recorders are gone; flush what is still queued
    if usage::drain(usage_worker, USAGE_DRAIN_TIMEOUT).await {
        info!("Usage queue drained");
    }

    Ok(())
}

fn spawn_eager_deploy(
    registry: Arc<ApiRegistry>,
    orchestrator: Arc<Orchestrator>,
    artifacts: Arc<dyn ArtifactStore>,
) {
    tokio::spawn(async move {
        let mut api_ids: Vec<String> = registry.snapshot().keys().cloned().collect();
        api_ids.sort();
        info!("Eagerly deploying {} APIs", api_ids.len());

        for api_id in api_ids {
            let artifact = match artifacts.fetch_artifact(&api_id).await {
                Ok(Some(artifact)) => artifact,
                Ok(None) => {
                    warn!(api_id = %api_id, "No code stored, skipping eager deploy");
                    continue;
                }
                Err(e) => {
                    error!(api_id = %api_id, "Failed to fetch artifact: {}", e);
                    continue;
                }
            };

            if let Err(e) = orchestrator.deploy(&api_id, &artifact).await {
                error!(api_id = %api_id, "Eager deploy failed: {}", e);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
