//! Orchestrator configuration
//!
//! Loaded from `DEPLOY_*` environment variables with defaults matching a
//! single-host deployment.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::ResourceLimits;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// First port of the deterministic port range
    pub base_port: u16,

    /// Number of ports in the range
    pub port_range: u16,

    /// Fallback attempts when the derived port is taken
    pub port_retries: u32,

    /// Image every API is built on top of
    pub base_image: String,

    /// Port the service listens on inside its container
    pub container_port: u16,

    pub limits: ResourceLimits,

    /// Container restarts allowed before a deployment is considered crashed
    pub max_restarts: u32,

    pub build_timeout: Duration,
    pub stop_timeout: Duration,
    pub ready_timeout: Duration,

    /// Docker daemon address; local defaults when unset
    pub docker_host: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_port: 9000,
            port_range: 10000,
            port_retries: 5,
            base_image: "python:3.11-slim".to_string(),
            container_port: 8000,
            limits: ResourceLimits::default(),
            max_restarts: 3,
            build_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(15),
            docker_host: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            base_port: parse_var("DEPLOY_BASE_PORT", defaults.base_port)?,
            port_range: parse_var("DEPLOY_PORT_RANGE", defaults.port_range)?,
            port_retries: parse_var("DEPLOY_PORT_RETRIES", defaults.port_retries)?,
            base_image: env::var("DEPLOY_BASE_IMAGE").unwrap_or(defaults.base_image),
            container_port: defaults.container_port,
            limits: ResourceLimits {
                memory_mb: parse_var("DEPLOY_MEMORY_MB", defaults.limits.memory_mb)?,
                cpus: parse_var("DEPLOY_CPUS", defaults.limits.cpus)?,
            },
            max_restarts: parse_var("DEPLOY_MAX_RESTARTS", defaults.max_restarts)?,
            build_timeout: Duration::from_secs(parse_var(
                "DEPLOY_BUILD_TIMEOUT_SECS",
                defaults.build_timeout.as_secs(),
            )?),
            stop_timeout: Duration::from_secs(parse_var(
                "DEPLOY_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
            ready_timeout: Duration::from_secs(parse_var(
                "DEPLOY_READY_TIMEOUT_SECS",
                defaults.ready_timeout.as_secs(),
            )?),
            docker_host: env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port_range == 0 {
            anyhow::bail!("DEPLOY_PORT_RANGE must be greater than 0");
        }

        if u32::from(self.base_port) + u32::from(self.port_range) > u32::from(u16::MAX) + 1 {
            anyhow::bail!("DEPLOY_BASE_PORT + DEPLOY_PORT_RANGE exceeds 65536");
        }

        if self.limits.memory_mb == 0 || self.limits.memory_mb > MAX_MEMORY_MB {
            anyhow::bail!("DEPLOY_MEMORY_MB must be between 1 and {}", MAX_MEMORY_MB);
        }

        if !self.limits.cpus.is_finite() || self.limits.cpus <= 0.0 || self.limits.cpus > MAX_CPUS
        {
            anyhow::bail!("DEPLOY_CPUS must be greater than 0 and at most {}", MAX_CPUS);
        }

        Ok(())
    }
}

/// Per-container ceilings accepted from configuration
const MAX_MEMORY_MB: u64 = 1024 * 1024;
const MAX_CPUS: f64 = 1024.0;

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
