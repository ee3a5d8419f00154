//! Data models for the API Registry

use genapi_common::{ApiRecord, DeploymentHandle, PlanTier};
use serde::Serialize;

/// Everything the gateway needs to authenticate, limit, and route one API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub api_id: String,

    /// Rate-limiting principal
    pub owner_id: String,

    /// SHA-256 hex digest of the API key
    #[serde(skip_serializing)]
    pub api_key_hash: String,

    pub plan: PlanTier,

    /// Overrides the plan budget when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_rate_limit: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Current deployment, `None` until first deployed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentHandle>,
}

impl RegistryEntry {
    /// Build an undeployed entry from a persistence record
    pub fn from_record(record: &ApiRecord) -> Self {
        Self {
            api_id: record.api_id.clone(),
            owner_id: record.owner_id.clone(),
            api_key_hash: record.api_key_hash.clone(),
            plan: record.plan,
            custom_rate_limit: record.custom_rate_limit,
            name: record.name.clone(),
            deployment: None,
        }
    }

    pub fn with_deployment(mut self, deployment: Option<DeploymentHandle>) -> Self {
        self.deployment = deployment;
        self
    }

    /// Whether requests can be forwarded without a cold start
    pub fn is_routable(&self) -> bool {
        self.deployment
            .as_ref()
            .map(DeploymentHandle::is_running)
            .unwrap_or(false)
    }
}
