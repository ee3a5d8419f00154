//! Data models for the Deployment Orchestrator

use chrono::{DateTime, Utc};
use genapi_common::{DeploymentHandle, DeploymentStatus};
use serde::{Deserialize, Serialize};

/// CPU and memory ceilings applied to every container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,

    /// Fractional CPU count
    pub cpus: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1.0,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Orchestrator-side bookkeeping for one API
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub handle: DeploymentHandle,

    pub resource_limits: ResourceLimits,

    /// Image tag the container was started from
    pub image: Option<String>,

    /// Most recent build or start failure
    pub last_error: Option<String>,

    /// Artifact version whose build failed; not rebuilt until forced
    #[serde(skip)]
    pub failed_version: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(api_id: &str, port: u16, resource_limits: ResourceLimits) -> Self {
        Self {
            handle: DeploymentHandle {
                api_id: api_id.to_string(),
                port,
                status: DeploymentStatus::Unloaded,
                artifact_version: String::new(),
                container_id: None,
            },
            resource_limits,
            image: None,
            last_error: None,
            failed_version: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: DeploymentStatus) {
        self.handle.status = status;
        self.updated_at = Utc::now();
    }
}

/// Point-in-time health of one deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub api_id: String,
    pub status: DeploymentStatus,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub port: Option<u16>,
    pub restart_count: u32,
}

impl HealthReport {
    pub fn without_process(api_id: &str, status: DeploymentStatus, port: Option<u16>) -> Self {
        Self {
            api_id: api_id.to_string(),
            status,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            port,
            restart_count: 0,
        }
    }
}

/// Health plus the context an operator needs to debug a deployment
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub health: HealthReport,
    pub artifact_version: Option<String>,
    pub image: Option<String>,
    pub last_error: Option<String>,
    pub recent_logs: Vec<String>,
}

/// One row of the deployment listing
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    pub api_id: String,
    pub port: u16,
    pub status: DeploymentStatus,
    pub artifact_version: String,
    pub image: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DeploymentRecord> for DeploymentSummary {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            api_id: record.handle.api_id.clone(),
            port: record.handle.port,
            status: record.handle.status,
            artifact_version: record.handle.artifact_version.clone(),
            image: record.image.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// What a sweep pass cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Containers with no registry entry, removed
    pub orphans_removed: Vec<String>,

    /// APIs whose container exhausted its restart budget
    pub crashed_reaped: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.orphans_removed.is_empty() && self.crashed_reaped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bytes_saturates() {
        let limits = ResourceLimits {
            memory_mb: u64::MAX,
            cpus: 1.0,
        };
        assert_eq!(limits.memory_bytes(), i64::MAX);
        assert_eq!(ResourceLimits::default().memory_bytes(), 512 * 1024 * 1024);
    }
}
