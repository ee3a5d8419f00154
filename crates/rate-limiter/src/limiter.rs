//! Admission decisions

use chrono::{DateTime, Utc};
use genapi_common::PlanTier;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{FailureMode, RateLimitConfig};
use crate::error::{RateLimitError, Result};
use crate::store::CounterStore;

/// Outcome of one rate-limit evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,

    /// Counter value after this call (attempts, not only admissions)
    pub used: u64,

    pub remaining: u64,

    /// Unix timestamp at which the current window ends
    pub reset_at: i64,

    /// Set when the store failed and the call was admitted without counting
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl RateDecision {
    fn evaluate(limit: u64, used: u64, reset_at: i64) -> Self {
        Self {
            allowed: used <= limit,
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_at,
            degraded: false,
        }
    }

    /// Seconds until the window resets, never negative
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now.timestamp()).max(0) as u64
    }
}

/// Start of the window containing `now`
pub fn window_start(now: DateTime<Utc>, window_secs: i64) -> i64 {
    let ts = now.timestamp();
    ts - ts.rem_euclid(window_secs)
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one attempt for `owner_id` and decide whether to admit it.
    ///
    /// Returns [`RateLimitError::Exceeded`] when the post-increment count is
    /// above the limit. Store failures follow the configured [`FailureMode`].
    pub async fn check(
        &self,
        owner_id: &str,
        plan: PlanTier,
        custom_limit: Option<u64>,
    ) -> Result<RateDecision> {
        self.check_at(owner_id, plan, custom_limit, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        owner_id: &str,
        plan: PlanTier,
        custom_limit: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let limit = self.config.limits.resolve(plan, custom_limit);
        let start = window_start(now, self.config.window_secs);
        let reset_at = start + self.config.window_secs;

        let used = match self
            .store
            .increment(owner_id, start, self.config.window_secs)
            .await
        {
            Ok(used) => used,
            Err(e) => return self.on_store_failure(owner_id, limit, reset_at, e),
        };

        let decision = RateDecision::evaluate(limit, used, reset_at);
        if !decision.allowed {
            debug!(owner_id = %owner_id, used, limit, "Rate limit exceeded");
            return Err(RateLimitError::Exceeded(decision));
        }

        Ok(decision)
    }

    /// Current usage without counting a request
    pub async fn status(
        &self,
        owner_id: &str,
        plan: PlanTier,
        custom_limit: Option<u64>,
    ) -> Result<RateDecision> {
        let now = Utc::now();
        let limit = self.config.limits.resolve(plan, custom_limit);
        let start = window_start(now, self.config.window_secs);
        let used = self.store.peek(owner_id, start).await?;

        let mut decision = RateDecision::evaluate(limit, used, start + self.config.window_secs);
        decision.allowed = used < limit;
        Ok(decision)
    }

    fn on_store_failure(
        &self,
        owner_id: &str,
        limit: u64,
        reset_at: i64,
        err: RateLimitError,
    ) -> Result<RateDecision> {
        match self.config.failure_mode {
            FailureMode::Open => {
                warn!(owner_id = %owner_id, "Rate limiter store failed, admitting: {}", err);
                Ok(RateDecision {
                    allowed: true,
                    limit,
                    used: 0,
                    remaining: limit,
                    reset_at,
                    degraded: true,
                })
            }
            FailureMode::Closed => {
                warn!(owner_id = %owner_id, "Rate limiter store failed, rejecting: {}", err);
                Err(err)
            }
        }
    }
}
