//! Data models shared across the runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Publication status of an API in the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    /// Callable; loaded into the registry on startup
    Active,
    /// Owner paused the API; never loaded
    Paused,
}

/// Subscription tier of the owning user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

/// One API as stored by the CRUD layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRecord {
    /// Externally assigned identifier
    pub api_id: String,

    /// Owning user; the rate-limiting principal
    pub owner_id: String,

    /// SHA-256 hex digest of the raw API key
    pub api_key_hash: String,

    /// Active or paused
    pub status: ApiStatus,

    /// Owner's plan tier
    #[serde(default)]
    pub plan: PlanTier,

    /// Per-user override of the hourly request budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_rate_limit: Option<u64>,

    /// Reference to the code artifact in the artifact store
    pub artifact_ref: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ApiRecord {
    pub fn is_active(&self) -> bool {
        self.status == ApiStatus::Active
    }
}

/// Generated code plus its dependency manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Service entry point source
    pub code: Vec<u8>,

    /// `package==version` requirements, one per entry
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Artifact {
    pub fn new(code: impl Into<Vec<u8>>, dependencies: Vec<String>) -> Self {
        Self {
            code: code.into(),
            dependencies,
        }
    }

    /// Build an artifact from a line-separated dependency manifest.
    ///
    /// Blank lines and `#` comments are dropped.
    pub fn from_manifest(code: impl Into<Vec<u8>>, manifest: &str) -> Self {
        let dependencies = manifest
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        Self::new(code, dependencies)
    }

    /// Dependencies rendered as a newline-terminated manifest
    pub fn manifest(&self) -> String {
        let mut out = String::new();
        for dep in &self.dependencies {
            out.push_str(dep);
            out.push('\n');
        }
        out
    }

    /// Content version of the code+dependency pair.
    ///
    /// Identical artifacts always yield the same version.
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.code);
        hasher.update([0u8]);
        hasher.update(self.manifest().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

/// Lifecycle state of a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Unloaded,
    Building,
    Running,
    Restarting,
    Crashed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Unloaded => "unloaded",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Restarting => "restarting",
            DeploymentStatus::Crashed => "crashed",
            DeploymentStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and in what state an API's isolated process is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub api_id: String,

    /// Loopback port the process listens on
    pub port: u16,

    pub status: DeploymentStatus,

    /// Version of the artifact the process was built from
    pub artifact_version: String,

    /// Runtime-assigned container identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl DeploymentHandle {
    pub fn is_running(&self) -> bool {
        self.status == DeploymentStatus::Running
    }
}

/// One completed gateway call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub api_id: String,
    pub owner_id: String,
    pub request_id: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub request_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parsing_skips_comments_and_blanks() {
        let artifact = Artifact::from_manifest(
            "app = 1",
            "requests==2.31.0\n\n# pinned\n  pillow==10.2.0  \n",
        );

        assert_eq!(
            artifact.dependencies,
            vec!["requests==2.31.0".to_string(), "pillow==10.2.0".to_string()]
        );
        assert_eq!(artifact.manifest(), "requests==2.31.0\npillow==10.2.0\n");
    }

    #[test]
    fn test_version_is_content_addressed() {
        let a = Artifact::new("print(1)", vec!["x==1".into()]);
        let b = Artifact::new("print(1)", vec!["x==1".into()]);
        let c = Artifact::new("print(2)", vec!["x==1".into()]);
        let d = Artifact::new("print(1)", vec!["x==2".into()]);

        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_ne!(a.version(), d.version());
        assert_eq!(a.version().len(), 16);
    }

    #[test]
    fn test_record_defaults_when_optional_fields_missing() {
        let json = r#"{
            "api_id": "abc",
            "owner_id": "user-1",
            "api_key_hash": "00",
            "status": "active",
            "artifact_ref": "abc"
        }"#;

        let record: ApiRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_active());
        assert_eq!(record.plan, PlanTier::Free);
        assert_eq!(record.custom_rate_limit, None);
    }
}
