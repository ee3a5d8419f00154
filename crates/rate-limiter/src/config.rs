//! Plan-tier budgets and limiter behaviour

use genapi_common::PlanTier;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default requests per window for each plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub free: u64,
    pub pro: u64,
    pub enterprise: u64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: 100,
            pro: 1_000,
            enterprise: 10_000,
        }
    }
}

impl PlanLimits {
    /// Resolve the effective limit: a custom override wins over the plan default
    pub fn resolve(&self, plan: PlanTier, custom: Option<u64>) -> u64 {
        if let Some(limit) = custom {
            return limit;
        }

        match plan {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

/// What to do when the counter store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request and log
    #[default]
    Open,
    /// Reject the request
    Closed,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailureMode::Open),
            "closed" => Ok(FailureMode::Closed),
            other => Err(format!("unknown rate limit failure mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub limits: PlanLimits,
    pub failure_mode: FailureMode,

    /// Window length in seconds
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limits: PlanLimits::default(),
            failure_mode: FailureMode::Open,
            window_secs: 3600,
        }
    }
}
