//! Orchestrator behaviour against an in-memory container runtime

use async_trait::async_trait;
use genapi_common::{hash_api_key, ApiRecord, ApiStatus, Artifact, DeploymentStatus, PlanTier};
use genapi_orchestrator::{
    container_name, image_tag, port, BuildContext, ContainerInfo, ContainerRuntime, ContainerSpec,
    ContainerState, Orchestrator, OrchestratorConfig, OrchestratorError, ResourceUsage,
};
use genapi_registry::{ApiRegistry, RegistryEntry};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockRuntime {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    images: Mutex<HashSet<String>>,
    builds: AtomicUsize,
    runs: AtomicUsize,
    next_id: AtomicUsize,
    fail_builds: AtomicBool,
    build_delay: Mutex<Duration>,
}

impl MockRuntime {
    fn container_for(&self, api_id: &str) -> Option<ContainerInfo> {
        self.containers
            .lock()
            .values()
            .find(|c| c.api_id() == Some(api_id))
            .cloned()
    }

    fn set_state(&self, container_id: &str, state: ContainerState, restarts: u32) {
        if let Some(info) = self.containers.lock().get_mut(container_id) {
            info.state = state;
            info.restart_count = restarts;
            info.exit_code = Some(1);
        }
    }

    fn insert(&self, info: ContainerInfo) {
        self.containers.lock().insert(info.id.clone(), info);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(
        &self,
        api_id: &str,
        tag: &str,
        context: &BuildContext,
    ) -> genapi_orchestrator::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock();
        tokio::time::sleep(delay).await;

        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Build {
                api_id: api_id.to_string(),
                reason: "ERROR: No matching distribution found for nonexistent==9.9".to_string(),
            });
        }

        assert!(context.file("main.py").is_some());
        self.images.lock().insert(tag.to_string());
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> genapi_orchestrator::Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock();
        if containers.values().any(|c| c.name == spec.name) {
            return Err(OrchestratorError::Runtime(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                state: ContainerState::Running,
                labels: spec.labels.clone(),
                restart_count: 0,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> genapi_orchestrator::Result<()> {
        if let Some(info) = self.containers.lock().get_mut(container) {
            info.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> genapi_orchestrator::Result<()> {
        self.containers.lock().remove(container);
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
            .find(|c| c.id == container || c.name == container)
            .cloned())
    }

    async fn stats(&self, _container: &str) -> genapi_orchestrator::Result<ResourceUsage> {
        Ok(ResourceUsage {
            cpu_percent: 1.5,
            memory_mb: 42.0,
        })
    }

    async fn list_managed(&self) -> genapi_orchestrator::Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn logs(&self, _container: &str, tail: usize) -> genapi_orchestrator::Result<Vec<String>> {
        Ok((0..tail.min(3)).map(|i| format!("line {}", i)).collect())
    }

    async fn wait_ready(&self, _port: u16, _timeout: Duration) -> bool {
        true
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        base_port: 41000,
        port_range: 8000,
        ..OrchestratorConfig::default()
    }
}

fn registered(api_ids: &[&str]) -> Arc<ApiRegistry> {
    let registry = Arc::new(ApiRegistry::new());
    for api_id in api_ids {
        registry.upsert(RegistryEntry::from_record(&ApiRecord {
            api_id: api_id.to_string(),
            owner_id: "owner".to_string(),
            api_key_hash: hash_api_key("key"),
            status: ApiStatus::Active,
            plan: PlanTier::Free,
            custom_rate_limit: None,
            artifact_ref: api_id.to_string(),
            name: None,
        }));
    }
    registry
}

fn setup(api_ids: &[&str]) -> (Arc<MockRuntime>, Arc<ApiRegistry>, Arc<Orchestrator>) {
    let runtime = Arc::new(MockRuntime::default());
    let registry = registered(api_ids);
    let orchestrator = Arc::new(Orchestrator::new(
        runtime.clone(),
        registry.clone(),
        test_config(),
    ));
    (runtime, registry, orchestrator)
}

fn artifact(body: &str) -> Artifact {
    Artifact::new(
        format!("from fastapi import FastAPI\napp = FastAPI()\n# {}\n", body),
        vec!["requests==2.31.0".to_string()],
    )
}

#[tokio::test]
async fn test_repeated_deploy_is_idempotent() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);

    let first = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();
    let second = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.port, port::derive_port("abc", 41000, 8000));
    assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.runs.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.containers.lock().len(), 1);
    assert!(registry.get("abc").unwrap().is_routable());
}

#[tokio::test]
async fn test_concurrent_cold_starts_build_once() {
    let (runtime, _registry, orchestrator) = setup(&["abc"]);
    *runtime.build_delay.lock() = Duration::from_millis(50);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.deploy("abc", &artifact("v1")).await })
        })
        .collect();

    let mut ports = HashSet::new();
    for task in tasks {
        ports.insert(task.await.unwrap().unwrap().port);
    }

    assert_eq!(ports.len(), 1);
    assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.containers.lock().len(), 1);
}

#[tokio::test]
async fn test_new_version_replaces_container_and_image() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);

    let v1 = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();
    let v2 = orchestrator.deploy("abc", &artifact("v2")).await.unwrap();

    assert_ne!(v1.artifact_version, v2.artifact_version);
    assert_ne!(v1.container_id, v2.container_id);
    assert_eq!(v1.port, v2.port);
    assert_eq!(runtime.containers.lock().len(), 1);

    let images = runtime.images.lock().clone();
    assert!(!images.contains(&image_tag("abc", &v1.artifact_version)));
    assert!(images.contains(&image_tag("abc", &v2.artifact_version)));

    let entry = registry.get("abc").unwrap();
    assert_eq!(entry.deployment.as_ref().unwrap().artifact_version, v2.artifact_version);
}

#[tokio::test]
async fn test_build_failure_leaves_crashed_and_is_not_retried() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);
    runtime.fail_builds.store(true, Ordering::SeqCst);

    let err = orchestrator.deploy("abc", &artifact("v1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Build { .. }));

    let record = orchestrator.record("abc").unwrap();
    assert_eq!(record.handle.status, DeploymentStatus::Crashed);
    assert!(record.last_error.unwrap().contains("No matching distribution"));
    assert!(!registry.get("abc").unwrap().is_routable());

    // Same version is not rebuilt implicitly
    let again = orchestrator.deploy("abc", &artifact("v1")).await;
    assert!(matches!(again, Err(OrchestratorError::Build { .. })));
    assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);

    // A forced restart rebuilds
    runtime.fail_builds.store(false, Ordering::SeqCst);
    let handle = orchestrator.restart("abc", &artifact("v1")).await.unwrap();
    assert_eq!(handle.status, DeploymentStatus::Running);
    assert_eq!(runtime.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);
    let handle = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();

    assert!(orchestrator.stop("abc").await.unwrap());
    assert!(!orchestrator.stop("abc").await.unwrap());
    assert!(!orchestrator.stop("never-deployed").await.unwrap());

    assert!(runtime.containers.lock().is_empty());
    assert!(!runtime
        .images
        .lock()
        .contains(&image_tag("abc", &handle.artifact_version)));
    assert!(registry.get("abc").unwrap().deployment.is_none());
    assert_eq!(
        orchestrator.health("abc").await.unwrap().status,
        DeploymentStatus::Stopped
    );
}

#[tokio::test]
async fn test_health_reports_crashed_when_process_gone() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);
    let handle = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();

    let running = orchestrator.health("abc").await.unwrap();
    assert_eq!(running.status, DeploymentStatus::Running);
    assert_eq!(running.memory_mb, 42.0);
    assert_eq!(running.port, Some(handle.port));

    runtime.containers.lock().clear();

    let report = orchestrator.health("abc").await.unwrap();
    assert_eq!(report.status, DeploymentStatus::Crashed);
    assert!(!registry.get("abc").unwrap().is_routable());

    // Next deploy brings it back
    let redeployed = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();
    assert_eq!(redeployed.status, DeploymentStatus::Running);
    assert!(registry.get("abc").unwrap().is_routable());
}

#[tokio::test]
async fn test_health_of_unknown_api_is_unloaded() {
    let (_runtime, _registry, orchestrator) = setup(&[]);
    let report = orchestrator.health("nope").await.unwrap();
    assert_eq!(report.status, DeploymentStatus::Unloaded);
    assert_eq!(report.port, None);
}

#[tokio::test]
async fn test_sweep_removes_orphans_and_reaps_crashed() {
    let (runtime, registry, orchestrator) = setup(&["keep", "flaky"]);
    orchestrator.deploy("keep", &artifact("keep")).await.unwrap();
    let flaky = orchestrator.deploy("flaky", &artifact("flaky")).await.unwrap();

    runtime.insert(ContainerInfo {
        id: "ghost-1".to_string(),
        name: container_name("ghost"),
        state: ContainerState::Running,
        labels: HashMap::from([
            ("app".to_string(), "genapi".to_string()),
            ("api_id".to_string(), "ghost".to_string()),
            ("artifact_version".to_string(), "0000".to_string()),
        ]),
        restart_count: 0,
        exit_code: None,
    });
    runtime.set_state(flaky.container_id.as_deref().unwrap(), ContainerState::Exited, 3);

    let report = orchestrator.sweep().await.unwrap();

    assert_eq!(report.orphans_removed, vec!["ghost".to_string()]);
    assert_eq!(report.crashed_reaped, vec!["flaky".to_string()]);
    assert!(runtime.container_for("keep").is_some());
    assert!(runtime.container_for("ghost").is_none());
    assert!(runtime.container_for("flaky").is_none());
    assert!(!registry.get("flaky").unwrap().is_routable());

    let second = orchestrator.sweep().await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_port_conflict_uses_fallback() {
    let (_runtime, _registry, orchestrator) = setup(&["busy"]);
    let derived = port::derive_port("busy", 41000, 8000);
    let _squatter = tokio::net::TcpListener::bind(("0.0.0.0", derived))
        .await
        .unwrap();

    let handle = orchestrator.deploy("busy", &artifact("v1")).await.unwrap();

    assert_ne!(handle.port, derived);
    let fallbacks: Vec<u16> = (1..=5)
        .map(|k| port::candidate_port("busy", 41000, 8000, k))
        .collect();
    assert!(fallbacks.contains(&handle.port));
}

#[tokio::test]
async fn test_port_conflict_without_retries_fails() {
    let runtime = Arc::new(MockRuntime::default());
    let registry = registered(&["busy2"]);
    let orchestrator = Orchestrator::new(
        runtime.clone(),
        registry,
        OrchestratorConfig {
            port_retries: 0,
            ..test_config()
        },
    );

    let derived = port::derive_port("busy2", 41000, 8000);
    let _squatter = tokio::net::TcpListener::bind(("0.0.0.0", derived))
        .await
        .unwrap();

    let err = orchestrator.deploy("busy2", &artifact("v1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PortConflict { port, .. } if port == derived));
    assert_eq!(
        orchestrator.record("busy2").unwrap().handle.status,
        DeploymentStatus::Crashed
    );
}

#[tokio::test]
async fn test_swap_waits_for_leases() {
    let (runtime, _registry, orchestrator) = setup(&["abc"]);
    let v1 = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();

    let lease = orchestrator.lease("abc").await.unwrap();
    assert_eq!(lease.handle, v1);

    let redeploy = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.deploy("abc", &artifact("v2")).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!redeploy.is_finished());
    let old = runtime.container_for("abc").unwrap();
    assert_eq!(Some(old.id.clone()), v1.container_id);
    assert_eq!(old.state, ContainerState::Running);

    drop(lease);
    let v2 = redeploy.await.unwrap().unwrap();
    assert_ne!(v2.container_id, v1.container_id);

    let lease = orchestrator.lease("abc").await.unwrap();
    assert_eq!(lease.handle, v2);
}

#[tokio::test]
async fn test_lease_requires_running_deployment() {
    let (_runtime, _registry, orchestrator) = setup(&["abc"]);
    assert!(orchestrator.lease("abc").await.is_none());
    assert!(orchestrator.lease("unknown").await.is_none());
}

#[tokio::test]
async fn test_adopts_matching_container_from_previous_process() {
    let (runtime, registry, orchestrator) = setup(&["abc"]);
    let artifact = artifact("v1");
    let version = artifact.version();

    runtime.insert(ContainerInfo {
        id: "left-over".to_string(),
        name: container_name("abc"),
        state: ContainerState::Running,
        labels: HashMap::from([
            ("app".to_string(), "genapi".to_string()),
            ("api_id".to_string(), "abc".to_string()),
            ("artifact_version".to_string(), version.clone()),
            ("port".to_string(), "41234".to_string()),
        ]),
        restart_count: 0,
        exit_code: None,
    });

    let handle = orchestrator.deploy("abc", &artifact).await.unwrap();

    assert_eq!(handle.port, 41234);
    assert_eq!(handle.container_id.as_deref(), Some("left-over"));
    assert_eq!(runtime.builds.load(Ordering::SeqCst), 0);
    assert!(registry.get("abc").unwrap().is_routable());
}

#[tokio::test]
async fn test_stale_container_with_other_version_is_replaced() {
    let (runtime, _registry, orchestrator) = setup(&["abc"]);

    runtime.insert(ContainerInfo {
        id: "old".to_string(),
        name: container_name("abc"),
        state: ContainerState::Running,
        labels: HashMap::from([
            ("app".to_string(), "genapi".to_string()),
            ("api_id".to_string(), "abc".to_string()),
            ("artifact_version".to_string(), "deadbeef".to_string()),
        ]),
        restart_count: 0,
        exit_code: None,
    });

    let handle = orchestrator.deploy("abc", &artifact("v1")).await.unwrap();

    assert_ne!(handle.container_id.as_deref(), Some("old"));
    assert_eq!(runtime.containers.lock().len(), 1);
}

#[tokio::test]
async fn test_list_and_diagnostics() {
    let (_runtime, _registry, orchestrator) = setup(&["b", "a"]);
    orchestrator.deploy("b", &artifact("b")).await.unwrap();
    orchestrator.deploy("a", &artifact("a")).await.unwrap();

    let listed: Vec<String> = orchestrator.list().into_iter().map(|d| d.api_id).collect();
    assert_eq!(listed, vec!["a".to_string(), "b".to_string()]);

    let diagnostics = orchestrator.diagnostics("a").await.unwrap();
    assert_eq!(diagnostics.health.status, DeploymentStatus::Running);
    assert_eq!(diagnostics.recent_logs.len(), 3);
    assert!(diagnostics.last_error.is_none());
    assert_eq!(
        diagnostics.image,
        Some(image_tag("a", &artifact("a").version()))
    );
}

#[tokio::test]
async fn test_ids_differing_in_case_are_isolated() {
    let (runtime, registry, orchestrator) = setup(&["abc", "ABC"]);

    let lower = orchestrator.deploy("abc", &artifact("lower")).await.unwrap();
    let upper = orchestrator.deploy("ABC", &artifact("upper")).await.unwrap();

    assert_ne!(lower.container_id, upper.container_id);
    assert_eq!(
        runtime.container_for("abc").map(|c| c.id),
        lower.container_id
    );
    assert_eq!(
        runtime.container_for("ABC").map(|c| c.id),
        upper.container_id
    );
    assert_eq!(runtime.containers.lock().len(), 2);
    assert!(registry.get("abc").unwrap().is_routable());

    // Stopping one leaves the other running
    assert!(orchestrator.stop("ABC").await.unwrap());
    assert!(runtime.container_for("abc").is_some());
    assert!(orchestrator.lease("abc").await.is_some());
}

#[tokio::test]
async fn test_teardown_ignores_container_of_another_api() {
    let (runtime, _registry, orchestrator) = setup(&["abc"]);

    runtime.insert(ContainerInfo {
        id: "foreign".to_string(),
        name: container_name("abc"),
        state: ContainerState::Running,
        labels: HashMap::from([
            ("app".to_string(), "genapi".to_string()),
            ("api_id".to_string(), "someone-else".to_string()),
        ]),
        restart_count: 0,
        exit_code: None,
    });

    assert!(!orchestrator.stop("abc").await.unwrap());
    assert!(runtime.containers.lock().contains_key("foreign"));
}
