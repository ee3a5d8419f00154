//! Deployment lifecycle
//!
//! One [`Slot`] per `api_id` carries two locks:
//! - `build` serializes deploy, restart, and stop for that API (single-flight)
//! - `traffic` is held shared by every forwarded request and exclusively
//!   while a container is swapped, so no request sees a half-torn-down
//!   process
//!
//! Different APIs never contend on either lock.

use chrono::Utc;
use dashmap::DashMap;
use genapi_common::{Artifact, DeploymentHandle, DeploymentStatus};
use genapi_registry::ApiRegistry;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::build_context::BuildContext;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{DeploymentRecord, DeploymentSummary, Diagnostics, HealthReport, SweepReport};
use crate::port::{candidate_port, derive_port, is_port_free};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, API_ID_LABEL, MANAGED_LABEL,
    MANAGED_VALUE, PORT_LABEL, VERSION_LABEL,
};

/// Log lines included in diagnostics
const DIAGNOSTIC_LOG_TAIL: usize = 50;

#[derive(Default)]
struct Slot {
    build: Mutex<()>,
    traffic: Arc<RwLock<()>>,
}

/// Shared access to a running deployment.
///
/// While any lease is held the deployment cannot be swapped out.
pub struct DeploymentLease {
    pub handle: DeploymentHandle,
    _guard: OwnedRwLockReadGuard<()>,
}

impl DeploymentLease {
    pub fn port(&self) -> u16 {
        self.handle.port
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ApiRegistry>,
    config: OrchestratorConfig,
    records: DashMap<String, DeploymentRecord>,
    slots: DashMap<String, Arc<Slot>>,
}

/// Longest readable prefix of an `api_id` kept in container and image names
const NAME_PREFIX_LEN: usize = 32;

/// Container name for an API.
///
/// Lowercased, with anything outside `[a-z0-9]` folded to `-`, then suffixed
/// with a digest of the raw id so ids differing only in case or punctuation
/// never share a name. Also valid as an image repository.
pub fn container_name(api_id: &str) -> String {
    let readable: String = api_id
        .chars()
        .take(NAME_PREFIX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let readable = readable.trim_matches('-');
    let digest = hex::encode(&Sha256::digest(api_id.as_bytes())[..6]);

    if readable.is_empty() {
        format!("genapi-{}", digest)
    } else {
        format!("genapi-{}-{}", readable, digest)
    }
}

pub fn image_tag(api_id: &str, version: &str) -> String {
    format!("{}:{}", container_name(api_id), version)
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ApiRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
            records: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn slot(&self, api_id: &str) -> Arc<Slot> {
        Arc::clone(self.slots.entry(api_id.to_string()).or_default().value())
    }

    /// Deploy an artifact, reusing the running deployment when its version
    /// already matches.
    ///
    /// Concurrent calls for the same API wait for the one in progress and
    /// then observe its result. A version whose build already failed is not
    /// rebuilt; use [`Orchestrator::restart`] to force it.
    pub async fn deploy(&self, api_id: &str, artifact: &Artifact) -> Result<DeploymentHandle> {
        let slot = self.slot(api_id);
        let _build = slot.build.lock().await;

        let version = artifact.version();
        if let Some(handle) = self.reusable(api_id, &version).await? {
            return Ok(handle);
        }

        if let Some(record) = self.records.get(api_id) {
            if record.failed_version.as_deref() == Some(version.as_str()) {
                return Err(OrchestratorError::Build {
                    api_id: api_id.to_string(),
                    reason: record
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "previous build failed".to_string()),
                });
            }
        }

        self.deploy_locked(api_id, artifact, &version, &slot).await
    }

    /// Replace the deployment with a fresh build of `artifact`, even if the
    /// version is unchanged
    pub async fn restart(&self, api_id: &str, artifact: &Artifact) -> Result<DeploymentHandle> {
        let slot = self.slot(api_id);
        let _build = slot.build.lock().await;

        info!(api_id = %api_id, "Restarting deployment");
        let version = artifact.version();
        self.deploy_locked(api_id, artifact, &version, &slot).await
    }

    /// Stop and remove the container and image. Returns whether anything
    /// was running; stopping an unknown API is not an error.
    pub async fn stop(&self, api_id: &str) -> Result<bool> {
        let slot = self.slot(api_id);
        let _build = slot.build.lock().await;
        let _traffic = slot.traffic.write().await;

        let removed = self.teardown(api_id, None).await?;

        if let Some(mut record) = self.records.get_mut(api_id) {
            record.set_status(DeploymentStatus::Stopped);
            record.handle.container_id = None;
        }
        self.registry.set_deployment(api_id, None);

        if removed {
            info!(api_id = %api_id, "Deployment stopped");
        } else {
            debug!(api_id = %api_id, "Stop requested but nothing was running");
        }
        Ok(removed)
    }

    /// Current health; a vanished process reports `crashed` rather than
    /// failing
    pub async fn health(&self, api_id: &str) -> Result<HealthReport> {
        let record = self.records.get(api_id).map(|r| r.clone());

        let Some(record) = record else {
            return Ok(HealthReport::without_process(
                api_id,
                DeploymentStatus::Unloaded,
                None,
            ));
        };

        let port = Some(record.handle.port);
        let status = record.handle.status;

        if matches!(
            status,
            DeploymentStatus::Building | DeploymentStatus::Stopped | DeploymentStatus::Unloaded
        ) {
            return Ok(HealthReport::without_process(api_id, status, port));
        }

        let Some(container_id) = record.handle.container_id.clone() else {
            return Ok(HealthReport::without_process(api_id, status, port));
        };

        let info = match self.runtime.inspect(&container_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(api_id = %api_id, "Inspect failed: {}", e);
                None
            }
        };

        let Some(info) = info else {
            self.mark_crashed(api_id, Some("container no longer exists".to_string()));
            return Ok(HealthReport::without_process(api_id, DeploymentStatus::Crashed, port));
        };

        let status = self.status_of(&info);
        if status == DeploymentStatus::Crashed {
            self.mark_crashed(
                api_id,
                Some(format!(
                    "container exited with code {} after {} restarts",
                    info.exit_code.unwrap_or_default(),
                    info.restart_count
                )),
            );
        }

        let usage = if info.state.is_running() {
            self.runtime.stats(&container_id).await.unwrap_or_default()
        } else {
            Default::default()
        };

        Ok(HealthReport {
            api_id: api_id.to_string(),
            status,
            cpu_percent: usage.cpu_percent,
            memory_mb: usage.memory_mb,
            port,
            restart_count: info.restart_count,
        })
    }

    /// Health plus last error and recent container output
    pub async fn diagnostics(&self, api_id: &str) -> Result<Diagnostics> {
        let health = self.health(api_id).await?;
        let record = self.records.get(api_id).map(|r| r.clone());

        let recent_logs = match record.as_ref().and_then(|r| r.handle.container_id.clone()) {
            Some(container_id) => self
                .runtime
                .logs(&container_id, DIAGNOSTIC_LOG_TAIL)
                .await
                .unwrap_or_else(|e| vec![format!("logs unavailable: {}", e)]),
            None => Vec::new(),
        };

        Ok(Diagnostics {
            health,
            artifact_version: record
                .as_ref()
                .map(|r| r.handle.artifact_version.clone())
                .filter(|v| !v.is_empty()),
            image: record.as_ref().and_then(|r| r.image.clone()),
            last_error: record.and_then(|r| r.last_error),
            recent_logs,
        })
    }

    /// Every deployment this orchestrator knows about, sorted by API
    pub fn list(&self) -> Vec<DeploymentSummary> {
        let mut summaries: Vec<DeploymentSummary> = self
            .records
            .iter()
            .map(|entry| DeploymentSummary::from(entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        summaries
    }

    pub fn record(&self, api_id: &str) -> Option<DeploymentRecord> {
        self.records.get(api_id).map(|r| r.clone())
    }

    /// Take a shared lease on the running deployment.
    ///
    /// Waits while a swap is in progress and returns `None` when nothing is
    /// running afterwards.
    pub async fn lease(&self, api_id: &str) -> Option<DeploymentLease> {
        let slot = self.slot(api_id);
        let guard = Arc::clone(&slot.traffic).read_owned().await;

        let handle = self
            .registry
            .get(api_id)?
            .deployment
            .clone()
            .filter(DeploymentHandle::is_running)?;

        Some(DeploymentLease {
            handle,
            _guard: guard,
        })
    }

    /// Record that requests cannot reach the deployment so the next caller
    /// redeploys it
    pub fn report_unreachable(&self, api_id: &str, reason: &str) {
        warn!(api_id = %api_id, "Deployment unreachable: {}", reason);
        self.mark_crashed(api_id, Some(reason.to_string()));
    }

    /// Remove containers with no registry entry and reap deployments that
    /// exhausted their restart budget
    pub async fn sweep(&self) -> Result<SweepReport> {
        let containers = self.runtime.list_managed().await?;
        let mut report = SweepReport::default();

        for info in containers {
            let Some(api_id) = info.api_id().map(str::to_string) else {
                warn!(container = %info.name, "Removing managed container without api_id label");
                self.destroy_container(&info).await;
                report.orphans_removed.push(info.name.clone());
                continue;
            };

            let slot = self.slot(&api_id);
            let Ok(_build) = slot.build.try_lock() else {
                debug!(api_id = %api_id, "Skipping sweep while a deploy is in progress");
                continue;
            };

            if !self.registry.contains(&api_id) {
                info!(api_id = %api_id, container = %info.name, "Removing orphaned container");
                self.destroy_container(&info).await;
                self.records.remove(&api_id);
                report.orphans_removed.push(api_id);
                continue;
            }

            let tracked = self
                .records
                .get(&api_id)
                .and_then(|r| r.handle.container_id.clone());
            if tracked.is_some() && tracked.as_deref() != Some(info.id.as_str()) {
                info!(api_id = %api_id, container = %info.name, "Removing stale container");
                self.destroy_container(&info).await;
                report.orphans_removed.push(api_id);
                continue;
            }

            if self.status_of(&info) == DeploymentStatus::Crashed {
                error!(
                    api_id = %api_id,
                    restarts = info.restart_count,
                    "Reaping crashed deployment"
                );
                let _traffic = slot.traffic.write().await;
                self.destroy_container(&info).await;
                self.mark_crashed(
                    &api_id,
                    Some(format!(
                        "container exited with code {} after {} restarts",
                        info.exit_code.unwrap_or_default(),
                        info.restart_count
                    )),
                );
                if let Some(mut record) = self.records.get_mut(&api_id) {
                    record.handle.container_id = None;
                }
                report.crashed_reaped.push(api_id);
            }
        }

        if !report.is_empty() {
            info!(
                "Sweep removed {} orphans, reaped {} crashed deployments",
                report.orphans_removed.len(),
                report.crashed_reaped.len()
            );
        }

        Ok(report)
    }

    /// Spawn a task running [`Orchestrator::sweep`] every `interval`
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.sweep().await {
                    error!("Sweep failed: {}", e);
                }
            }
        })
    }

    async fn reusable(&self, api_id: &str, version: &str) -> Result<Option<DeploymentHandle>> {
        let record = self.records.get(api_id).map(|r| r.clone());

        if let Some(record) = record {
            if record.handle.is_running() && record.handle.artifact_version == version {
                if let Some(container_id) = &record.handle.container_id {
                    if let Some(info) = self.runtime.inspect(container_id).await? {
                        if info.state.is_running() {
                            self.registry
                                .set_deployment(api_id, Some(record.handle.clone()));
                            return Ok(Some(record.handle));
                        }
                    }
                }
            }
            return Ok(None);
        }

        // Nothing tracked: adopt a matching container left by an earlier process
        let Some(info) = self.named_container(api_id).await? else {
            return Ok(None);
        };

        match (info.state.is_running(), info.artifact_version(), info.host_port()) {
            (true, Some(existing), Some(port)) if existing == version => {
                let mut record = DeploymentRecord::new(api_id, port, self.config.limits);
                record.handle.artifact_version = version.to_string();
                record.handle.container_id = Some(info.id.clone());
                record.image = Some(image_tag(api_id, version));
                record.set_status(DeploymentStatus::Running);

                let handle = record.handle.clone();
                self.records.insert(api_id.to_string(), record);
                self.registry.set_deployment(api_id, Some(handle.clone()));

                info!(api_id = %api_id, port, "Adopted running container");
                Ok(Some(handle))
            }
            _ => Ok(None),
        }
    }

    async fn deploy_locked(
        &self,
        api_id: &str,
        artifact: &Artifact,
        version: &str,
        slot: &Slot,
    ) -> Result<DeploymentHandle> {
        let derived = derive_port(api_id, self.config.base_port, self.config.port_range);

        self.records
            .entry(api_id.to_string())
            .or_insert_with(|| DeploymentRecord::new(api_id, derived, self.config.limits))
            .set_status(DeploymentStatus::Building);

        info!(api_id = %api_id, version = %version, "Building deployment");

        let tag = image_tag(api_id, version);
        if let Err(e) = self.build(api_id, artifact, &tag).await {
            error!(api_id = %api_id, "Build failed: {}", e);
            let _traffic = slot.traffic.write().await;
            if let Err(teardown_err) = self.teardown(api_id, None).await {
                warn!(api_id = %api_id, "Teardown after failed build: {}", teardown_err);
            }
            if let Some(mut record) = self.records.get_mut(api_id) {
                record.failed_version = Some(version.to_string());
                record.handle.container_id = None;
            }
            self.mark_crashed(api_id, Some(e.to_string()));
            return Err(e);
        }

        let _traffic = slot.traffic.write().await;
        if let Err(e) = self.teardown(api_id, Some(&tag)).await {
            self.mark_crashed(api_id, Some(e.to_string()));
            return Err(e);
        }

        let started = self.start(api_id, version, &tag).await;
        let (port, container_id) = match started {
            Ok(started) => started,
            Err(e) => {
                self.mark_crashed(api_id, Some(e.to_string()));
                return Err(e);
            }
        };

        if !self.runtime.wait_ready(port, self.config.ready_timeout).await {
            warn!(
                api_id = %api_id,
                port,
                "Service did not answer within {}s; continuing",
                self.config.ready_timeout.as_secs()
            );
        }

        let handle = DeploymentHandle {
            api_id: api_id.to_string(),
            port,
            status: DeploymentStatus::Running,
            artifact_version: version.to_string(),
            container_id: Some(container_id),
        };

        if let Some(mut record) = self.records.get_mut(api_id) {
            record.handle = handle.clone();
            record.image = Some(tag.clone());
            record.last_error = None;
            record.failed_version = None;
            record.updated_at = Utc::now();
        }

        if !self.registry.set_deployment(api_id, Some(handle.clone())) {
            debug!(api_id = %api_id, "Deployed API is not in the registry");
        }

        info!(api_id = %api_id, port, version = %version, "Deployment running");
        Ok(handle)
    }

    async fn build(&self, api_id: &str, artifact: &Artifact, tag: &str) -> Result<()> {
        let context =
            BuildContext::for_artifact(artifact, &self.config.base_image, self.config.container_port)
                .map_err(|e| OrchestratorError::Build {
                    api_id: api_id.to_string(),
                    reason: e.to_string(),
                })?;

        let timeout = self.config.build_timeout;
        match tokio::time::timeout(timeout, self.runtime.build_image(api_id, tag, &context)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Build {
                api_id: api_id.to_string(),
                reason: format!("build timed out after {}s", timeout.as_secs()),
            }),
        }
    }

    /// Start the container on the derived port or the first free fallback
    async fn start(&self, api_id: &str, version: &str, image: &str) -> Result<(u16, String)> {
        let derived = derive_port(api_id, self.config.base_port, self.config.port_range);

        for attempt in 0..=self.config.port_retries {
            let port = candidate_port(
                api_id,
                self.config.base_port,
                self.config.port_range,
                attempt,
            );

            if self.port_held_by_other(api_id, port) || !is_port_free(port).await {
                warn!(api_id = %api_id, port, attempt, "Port in use, trying fallback");
                continue;
            }

            let spec = self.container_spec(api_id, version, image, port);
            match self.runtime.run(&spec).await {
                Ok(container_id) => return Ok((port, container_id)),
                Err(OrchestratorError::PortConflict { .. }) => {
                    warn!(api_id = %api_id, port, attempt, "Port taken at start, trying fallback");
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::PortConflict {
            api_id: api_id.to_string(),
            port: derived,
        })
    }

    fn port_held_by_other(&self, api_id: &str, port: u16) -> bool {
        self.records.iter().any(|entry| {
            entry.key() != api_id
                && entry.handle.port == port
                && matches!(
                    entry.handle.status,
                    DeploymentStatus::Running | DeploymentStatus::Restarting
                )
        })
    }

    fn container_spec(&self, api_id: &str, version: &str, image: &str, port: u16) -> ContainerSpec {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), MANAGED_VALUE.to_string()),
            (API_ID_LABEL.to_string(), api_id.to_string()),
            (VERSION_LABEL.to_string(), version.to_string()),
            (PORT_LABEL.to_string(), port.to_string()),
        ]);

        ContainerSpec {
            name: container_name(api_id),
            image: image.to_string(),
            host_port: port,
            container_port: self.config.container_port,
            labels,
            limits: self.config.limits,
            max_restarts: self.config.max_restarts,
        }
    }

    /// Stop and remove whatever container currently serves the API, and its
    /// image unless it is `keep_image`. Caller holds the traffic lock.
    async fn teardown(&self, api_id: &str, keep_image: Option<&str>) -> Result<bool> {
        let tracked = self
            .records
            .get(api_id)
            .and_then(|r| r.handle.container_id.clone());

        let target = match tracked {
            Some(id) => Some(id),
            None => self.named_container(api_id).await?.map(|info| info.id),
        };

        let Some(container_id) = target else {
            return Ok(false);
        };

        let stop = self.runtime.stop(&container_id, self.config.stop_timeout);
        match tokio::time::timeout(self.config.stop_timeout + Duration::from_secs(5), stop).await {
            Ok(result) => result?,
            Err(_) => warn!(api_id = %api_id, "Stop timed out, forcing removal"),
        }
        self.runtime.remove_container(&container_id).await?;

        let image = self.records.get_mut(api_id).and_then(|mut record| {
            record.handle.container_id = None;
            record.image.take()
        });

        if let Some(image) = image.filter(|image| Some(image.as_str()) != keep_image) {
            if let Err(e) = self.runtime.remove_image(&image).await {
                warn!(api_id = %api_id, image = %image, "Failed to remove image: {}", e);
            }
        }

        Ok(true)
    }

    /// The container under this API's name, if its label says it belongs to
    /// this API
    async fn named_container(&self, api_id: &str) -> Result<Option<ContainerInfo>> {
        let info = self.runtime.inspect(&container_name(api_id)).await?;
        Ok(info.filter(|info| info.api_id() == Some(api_id)))
    }

    async fn destroy_container(&self, info: &ContainerInfo) {
        if let Err(e) = self.runtime.stop(&info.id, self.config.stop_timeout).await {
            warn!(container = %info.name, "Stop failed during sweep: {}", e);
        }
        if let Err(e) = self.runtime.remove_container(&info.id).await {
            warn!(container = %info.name, "Remove failed during sweep: {}", e);
        }
        if let (Some(api_id), Some(version)) = (info.api_id(), info.artifact_version()) {
            let image = image_tag(api_id, version);
            if let Err(e) = self.runtime.remove_image(&image).await {
                debug!(image = %image, "Image not removed: {}", e);
            }
        }
    }

    fn status_of(&self, info: &ContainerInfo) -> DeploymentStatus {
        match info.state {
            ContainerState::Running => DeploymentStatus::Running,
            ContainerState::Restarting => DeploymentStatus::Restarting,
            ContainerState::Created => DeploymentStatus::Building,
            ContainerState::Exited | ContainerState::Dead | ContainerState::Unknown => {
                if info.restart_count >= self.config.max_restarts || info.exit_code == Some(0) {
                    DeploymentStatus::Crashed
                } else {
                    DeploymentStatus::Restarting
                }
            }
        }
    }

    fn mark_crashed(&self, api_id: &str, reason: Option<String>) {
        let handle = match self.records.get_mut(api_id) {
            Some(mut record) => {
                record.set_status(DeploymentStatus::Crashed);
                if reason.is_some() {
                    record.last_error = reason;
                }
                Some(record.handle.clone())
            }
            None => None,
        };

        if let Some(handle) = handle {
            self.registry.set_deployment(api_id, Some(handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_names_are_distinct_per_id() {
        let names: Vec<String> = ["abc", "ABC", "a/b", "a b", "a-b"]
            .iter()
            .map(|id| container_name(id))
            .collect();

        for (i, name) in names.iter().enumerate() {
            assert!(names[i + 1..].iter().all(|other| other != name));
        }
        assert!(names[0].starts_with("genapi-abc-"));
        assert_eq!(container_name("abc"), container_name("abc"));
    }

    #[test]
    fn test_container_name_is_docker_safe() {
        let long = "x".repeat(200);
        for id in ["Weather API/v2", "--", "ümlaut", long.as_str()] {
            let name = container_name(id);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(!name.ends_with('-'));
            assert!(name.len() <= "genapi-".len() + NAME_PREFIX_LEN + 1 + 12);
        }
        assert!(image_tag("Weather API/v2", "1a2b").ends_with(":1a2b"));
    }
}
