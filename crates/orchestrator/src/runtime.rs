//! Container runtime abstraction
//!
//! The orchestrator talks to containers only through [`ContainerRuntime`].
//! [`crate::docker::DockerRuntime`] is the production implementation.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::build_context::BuildContext;
use crate::error::Result;
use crate::models::ResourceLimits;

/// Label marking containers owned by the runtime
pub const MANAGED_LABEL: &str = "app";
pub const MANAGED_VALUE: &str = "genapi";
pub const API_ID_LABEL: &str = "api_id";
pub const VERSION_LABEL: &str = "artifact_version";
pub const PORT_LABEL: &str = "port";

/// Everything needed to start one API container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,

    /// Automatic restarts on non-zero exit before giving up
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub restart_count: u32,
    pub exit_code: Option<i64>,
}

impl ContainerInfo {
    pub fn api_id(&self) -> Option<&str> {
        self.labels.get(API_ID_LABEL).map(String::as_str)
    }

    pub fn artifact_version(&self) -> Option<&str> {
        self.labels.get(VERSION_LABEL).map(String::as_str)
    }

    pub fn host_port(&self) -> Option<u16> {
        self.labels.get(PORT_LABEL).and_then(|p| p.parse().ok())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build and tag an image from a context. Build failures carry the
    /// builder output in the error.
    async fn build_image(&self, api_id: &str, tag: &str, context: &BuildContext) -> Result<()>;

    /// Create and start a container, returning its id.
    ///
    /// Fails with `PortConflict` when the host port is already allocated.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    /// Stop a container; a missing or already stopped container is not an error
    async fn stop(&self, container: &str, timeout: Duration) -> Result<()>;

    /// Remove a container; a missing container is not an error
    async fn remove_container(&self, container: &str) -> Result<()>;

    /// Remove an image; a missing image is not an error
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Current state by id or name; `None` when no such container exists
    async fn inspect(&self, container: &str) -> Result<Option<ContainerInfo>>;

    async fn stats(&self, container: &str) -> Result<ResourceUsage>;

    /// Every container carrying the managed label, running or not
    async fn list_managed(&self) -> Result<Vec<ContainerInfo>>;

    /// Last `tail` lines of combined stdout and stderr
    async fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>>;

    /// Poll the service until it answers any HTTP request or `timeout` passes
    async fn wait_ready(&self, port: u16, timeout: Duration) -> bool {
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/", port);
        let deadline = Instant::now() + timeout;

        loop {
            let attempt = client
                .get(&url)
                .timeout(Duration::from_secs(1))
                .send()
                .await;

            match attempt {
                Ok(response) => {
                    debug!("Port {} ready with status {}", port, response.status());
                    return true;
                }
                Err(_) if Instant::now() >= deadline => return false,
                Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
            }
        }
    }
}
