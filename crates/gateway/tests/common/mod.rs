//! Test harness: a container runtime that serves each deployment as an
//! in-process axum server on its assigned loopback port

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Request, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use genapi_common::{hash_api_key, ApiRecord, ApiStatus, Artifact, MemoryStore, PlanTier};
use genapi_gateway::{create_router, AppState, GatewayConfig, UsageRecorder};
use genapi_orchestrator::{
    BuildContext, ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, Orchestrator,
    OrchestratorConfig, OrchestratorError, ResourceUsage,
};
use genapi_ratelimit::{MemoryCounterStore, RateLimitConfig, RateLimiter};
use genapi_registry::ApiRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const ADMIN_KEY: &str = "admin-secret";

struct Container {
    info: ContainerInfo,
    server: Option<JoinHandle<()>>,
}

type Containers = Arc<Mutex<HashMap<String, Container>>>;

#[derive(Default)]
pub struct LoopbackRuntime {
    images: Mutex<HashMap<String, String>>,
    containers: Containers,
    pub builds: AtomicUsize,
    next_id: AtomicUsize,
    pub build_delay: Mutex<Duration>,
}

impl LoopbackRuntime {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|c| c.info.state.is_running())
            .count()
    }
}

#[derive(Clone)]
struct Deployment {
    container_id: String,
    revision: String,
    containers: Containers,
}

/// Revision marker embedded in test code as `# revision: <name>`
fn revision_of(code: &str) -> String {
    code.lines()
        .find_map(|line| line.trim().strip_prefix("# revision:"))
        .map(|rev| rev.trim().to_string())
        .unwrap_or_default()
}

fn deployment_app(deployment: Deployment) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/echo", post(echo_multipart))
        .route("/slow", get(slow))
        .route("/sleep", get(sleepy))
        .route("/crash", get(crash))
        .fallback(echo_request)
        .with_state(deployment)
}

async fn index(State(deployment): State<Deployment>) -> Json<Value> {
    Json(json!({ "ok": true, "revision": deployment.revision }))
}

async fn slow(State(deployment): State<Deployment>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(200)).await;
    Json(json!({ "ok": true, "revision": deployment.revision }))
}

async fn sleepy() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({ "ok": true }))
}

async fn crash(State(deployment): State<Deployment>) -> Json<Value> {
    if let Some(container) = deployment.containers.lock().get_mut(&deployment.container_id) {
        container.info.state = ContainerState::Exited;
        container.info.restart_count = 3;
        container.info.exit_code = Some(1);
        if let Some(server) = &container.server {
            server.abort();
        }
    }
    std::panic::resume_unwind(Box::new("deployment crashed"))
}

async fn echo_multipart(mut multipart: Multipart) -> Json<Value> {
    let mut files = Vec::new();
    let mut fields = serde_json::Map::new();
    let mut raw = serde_json::Map::new();

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.unwrap();
                files.push(json!({
                    "name": name,
                    "file_name": file_name,
                    "content_type": content_type,
                    "data": hex::encode(&data),
                }));
            }
            None => {
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.unwrap();
                raw.insert(
                    name.clone(),
                    json!({ "content_type": content_type, "data": hex::encode(&data) }),
                );
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    fields.insert(name, Value::String(text));
                }
            }
        }
    }

    Json(json!({ "files": files, "fields": fields, "raw": raw }))
}

async fn echo_request(req: Request) -> Json<Value> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();

    Json(json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

#[async_trait]
impl ContainerRuntime for LoopbackRuntime {
    async fn build_image(
        &self,
        api_id: &str,
        tag: &str,
        context: &BuildContext,
    ) -> genapi_orchestrator::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock();
        tokio::time::sleep(delay).await;

        let code = context
            .file("main.py")
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        if code.contains("FAIL_BUILD") {
            return Err(OrchestratorError::Build {
                api_id: api_id.to_string(),
                reason: "ERROR: Could not find a version that satisfies nonexistent==9.9".to_string(),
            });
        }

        self.images.lock().insert(tag.to_string(), code);
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> genapi_orchestrator::Result<String> {
        let code = self
            .images
            .lock()
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| OrchestratorError::Runtime(format!("no such image: {}", spec.image)))?;

        if self.containers.lock().values().any(|c| c.info.name == spec.name) {
            return Err(OrchestratorError::Runtime(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let listener = TcpListener::bind(("127.0.0.1", spec.host_port))
            .await
            .map_err(|_| OrchestratorError::PortConflict {
                api_id: spec.labels.get("api_id").cloned().unwrap_or_default(),
                port: spec.host_port,
            })?;

        let id = format!("loop-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let app = deployment_app(Deployment {
            container_id: id.clone(),
            revision: revision_of(&code),
            containers: self.containers.clone(),
        });

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        self.containers.lock().insert(
            id.clone(),
            Container {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    state: ContainerState::Running,
                    labels: spec.labels.clone(),
                    restart_count: 0,
                    exit_code: None,
                },
                server: Some(server),
            },
        );

        Ok(id)
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> genapi_orchestrator::Result<()> {
        let server = self.containers.lock().get_mut(container).and_then(|c| {
            if c.info.state.is_running() {
                c.info.state = ContainerState::Exited;
                c.info.exit_code = Some(0);
            }
            c.server.take()
        });

        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> genapi_orchestrator::Result<()> {
        let removed = self.containers.lock().remove(container);
        if let Some(server) = removed.and_then(|c| c.server) {
            server.abort();
            let _ = server.await;
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> genapi_orchestrator::Result<()> {
        self.images.lock().remove(image);
        Ok(())
    }

    async fn inspect(&self, container: &str) -> genapi_orchestrator::Result<Option<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .values()
            .find(|c| c.info.id == container || c.info.name == container)
            .map(|c| c.info.clone()))
    }

    async fn stats(&self, _container: &str) -> genapi_orchestrator::Result<ResourceUsage> {
        Ok(ResourceUsage {
            cpu_percent: 0.5,
            memory_mb: 24.0,
        })
    }

    async fn list_managed(&self) -> genapi_orchestrator::Result<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .values()
            .map(|c| c.info.clone())
            .collect())
    }

    async fn logs(&self, container: &str, _tail: usize) -> genapi_orchestrator::Result<Vec<String>> {
        Ok(vec![format!("{} started", container)])
    }
}

pub struct TestGateway {
    pub app: Router,
    pub state: AppState,
    pub runtime: Arc<LoopbackRuntime>,
    pub store: Arc<MemoryStore>,
}

pub fn api_key(api_id: &str) -> String {
    format!("key-{}", api_id)
}

pub fn record(api_id: &str, owner_id: &str) -> ApiRecord {
    ApiRecord {
        api_id: api_id.to_string(),
        owner_id: owner_id.to_string(),
        api_key_hash: hash_api_key(&api_key(api_id)),
        status: ApiStatus::Active,
        plan: PlanTier::Free,
        custom_rate_limit: None,
        artifact_ref: api_id.to_string(),
        name: None,
    }
}

pub fn artifact(revision: &str) -> Artifact {
    Artifact::new(
        format!(
            "from fastapi import FastAPI\n# revision: {}\napp = FastAPI()\n",
            revision
        ),
        vec!["requests==2.31.0".to_string()],
    )
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        admin_api_key: ADMIN_KEY.to_string(),
        forward_timeout: Duration::from_secs(5),
        rate_limit: RateLimitConfig::default(),
        ..GatewayConfig::default()
    }
}

/// Gateway with every `api_id` registered under `owner_id` and stored with
/// a `v1` artifact
pub async fn gateway(api_ids: &[&str], owner_id: &str) -> TestGateway {
    gateway_with(api_ids, owner_id, test_config()).await
}

pub async fn gateway_with(api_ids: &[&str], owner_id: &str, config: GatewayConfig) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    for api_id in api_ids {
        store.put_record(record(api_id, owner_id));
        store.put_artifact(api_id, artifact("v1"));
    }

    let registry = Arc::new(ApiRegistry::new());
    registry.load_all(store.as_ref()).await.unwrap();

    let runtime = Arc::new(LoopbackRuntime::default());
    let orchestrator = Arc::new(Orchestrator::new(
        runtime.clone(),
        registry.clone(),
        OrchestratorConfig {
            base_port: 43000,
            port_range: 4000,
            build_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(2),
            ..OrchestratorConfig::default()
        },
    ));

    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        config.rate_limit.clone(),
    ));
    let (usage, _worker) = UsageRecorder::spawn(store.clone(), 1024);

    let state = AppState::new(
        config,
        registry,
        orchestrator,
        limiter,
        store.clone(),
        store.clone(),
        usage,
    )
    .unwrap();

    TestGateway {
        app: create_router(state.clone()),
        state,
        runtime,
        store,
    }
}

impl TestGateway {
    pub async fn send(&self, req: axum::http::Request<Body>) -> axum::response::Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    /// `GET /run/{api_id}{path}` with the API's own key
    pub async fn call(&self, api_id: &str, path: &str) -> axum::response::Response {
        self.send(
            axum::http::Request::builder()
                .uri(format!("/run/{}{}", api_id, path))
                .header("authorization", format!("Bearer {}", api_key(api_id)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn admin(&self, method: &str, uri: &str) -> axum::response::Response {
        self.send(
            axum::http::Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
