//! Docker runtime implementation using bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{
    ContainerState as BollardState, ContainerStateStatusEnum, HostConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::build_context::BuildContext;
use crate::error::{OrchestratorError, Result};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ResourceUsage, MANAGED_LABEL,
    MANAGED_VALUE,
};

/// Lines of builder output kept in a build error
const BUILD_LOG_TAIL: usize = 20;

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `docker_host`, or local defaults when `None`
    pub fn connect(docker_host: Option<&str>) -> Result<Self> {
        let client = match docker_host {
            Some(url) => Docker::connect_with_http(url, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| OrchestratorError::Runtime(format!("failed to connect to Docker: {e}")))?;

        Ok(Self { client })
    }

    /// Check the daemon answers
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        bindings.insert(
            format!("{}/tcp", spec.container_port),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            nano_cpus: Some(spec.limits.nano_cpus()),
            port_bindings: Some(bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(i64::from(spec.max_restarts)),
            }),
            ..Default::default()
        }
    }

    fn map_state(state: Option<&BollardState>) -> ContainerState {
        let Some(s) = state else {
            return ContainerState::Unknown;
        };

        if s.restarting == Some(true) {
            return ContainerState::Restarting;
        }
        if s.running == Some(true) {
            return ContainerState::Running;
        }

        match s.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    fn map_summary_state(state: Option<&str>) -> ContainerState {
        match state {
            Some("created") => ContainerState::Created,
            Some("running") => ContainerState::Running,
            Some("restarting") => ContainerState::Restarting,
            Some("exited") => ContainerState::Exited,
            Some("dead") => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    fn is_port_in_use(message: &str) -> bool {
        message.contains("port is already allocated") || message.contains("address already in use")
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, api_id: &str, tag: &str, context: &BuildContext) -> Result<()> {
        let tar = context.to_tar()?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            labels: HashMap::from([(MANAGED_LABEL.to_string(), MANAGED_VALUE.to_string())]),
            ..Default::default()
        };

        debug!(api_id = %api_id, tag = %tag, "building image");

        let mut output: Vec<String> = Vec::new();
        let mut stream = self.client.build_image(options, None, Some(Bytes::from(tar)));

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| OrchestratorError::Build {
                api_id: api_id.to_string(),
                reason: e.to_string(),
            })?;

            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    output.push(line.to_string());
                }
            }

            if let Some(error) = info.error {
                let start = output.len().saturating_sub(BUILD_LOG_TAIL);
                return Err(OrchestratorError::Build {
                    api_id: api_id.to_string(),
                    reason: format!("{}\n{}", error.trim_end(), output[start..].join("\n")),
                });
            }
        }

        info!(api_id = %api_id, tag = %tag, "image built");
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(format!("{}/tcp", spec.container_port), HashMap::new())]);

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self.client.create_container(Some(options), config).await?;

        let started = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await;

        match started {
            Ok(()) => {
                info!(id = %created.id, name = %spec.name, port = spec.host_port, "container started");
                Ok(created.id)
            }
            Err(bollard::errors::Error::DockerResponseServerError { message, .. })
                if Self::is_port_in_use(&message) =>
            {
                warn!(name = %spec.name, port = spec.host_port, "host port already allocated");
                self.remove_container(&created.id).await?;
                Err(OrchestratorError::PortConflict {
                    api_id: spec
                        .labels
                        .get(crate::runtime::API_ID_LABEL)
                        .cloned()
                        .unwrap_or_default(),
                    port: spec.host_port,
                })
            }
            Err(e) => {
                self.remove_container(&created.id).await?;
                Err(e.into())
            }
        }
    }

    async fn stop(&self, container: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(()) => {
                debug!(container = %container, "container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(()) => {
                debug!(container = %container, "container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_image(image, Some(options), None).await {
            Ok(_) => {
                debug!(image = %image, "image removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, container: &str) -> Result<Option<ContainerInfo>> {
        let inspect = match self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state: Self::map_state(inspect.state.as_ref()),
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
            restart_count: inspect.restart_count.map(|c| c as u32).unwrap_or(0),
            exit_code: inspect.state.as_ref().and_then(|s| s.exit_code),
        }))
    }

    async fn stats(&self, container: &str) -> Result<ResourceUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client.stats(container, Some(options));
        let Some(result) = stream.next().await else {
            return Err(OrchestratorError::NotFound(container.to_string()));
        };
        let stats = result?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let num_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0.0 {
            (cpu_delta / system_delta) * num_cpus * 100.0
        } else {
            0.0
        };

        let memory_mb = stats.memory_stats.usage.unwrap_or(0) as f64 / (1024.0 * 1024.0);

        Ok(ResourceUsage {
            cpu_percent,
            memory_mb,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", MANAGED_LABEL, MANAGED_VALUE)],
        )]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        let mut containers = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let id = summary.id.unwrap_or_default();
            let state = Self::map_summary_state(summary.state.as_deref());

            // Restart counts are only reported by inspect
            let (restart_count, exit_code) = if state.is_running() {
                (0, None)
            } else {
                match self.inspect(&id).await? {
                    Some(info) => (info.restart_count, info.exit_code),
                    None => continue,
                }
            };

            containers.push(ContainerInfo {
                name: summary
                    .names
                    .and_then(|n| n.first().cloned())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                id,
                state,
                labels: summary.labels.unwrap_or_default(),
                restart_count,
                exit_code,
            });
        }

        Ok(containers)
    }

    async fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            follow: false,
            ..Default::default()
        };

        let mut stream = self.client.logs(container, Some(options));
        let mut output = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(chunk) => output.extend_from_slice(&chunk.into_bytes()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(OrchestratorError::NotFound(container.to_string())),
                Err(e) => {
                    warn!(container = %container, error = %e, "error reading logs");
                    break;
                }
            }
        }

        Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(str::to_string)
            .collect())
    }
}
