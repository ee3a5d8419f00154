//! Gateway configuration
//!
//! Loads configuration from environment variables with sensible defaults.
//! Container settings live in [`genapi_orchestrator::OrchestratorConfig`].

use anyhow::{Context, Result};
use genapi_ratelimit::{FailureMode, PlanLimits, RateLimitConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where rate-limit counters are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    /// Shared across gateway instances
    Redis,
    /// Local to this process
    Memory,
}

impl FromStr for CounterBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(CounterBackend::Redis),
            "memory" => Ok(CounterBackend::Memory),
            other => Err(format!("unknown rate limit backend: {}", other)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway server host
    pub host: String,

    /// Gateway server port
    pub port: u16,

    /// Bearer credential for `/admin/*` and `/metrics`
    pub admin_api_key: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Upper bound for one forwarded call
    pub forward_timeout: Duration,

    /// Largest request body accepted on `/run`
    pub max_request_bytes: usize,

    /// Deploy every loaded API at startup instead of on first call
    pub eager_deploy: bool,

    pub sweep_interval: Duration,

    pub rate_limit: RateLimitConfig,

    pub counter_backend: CounterBackend,

    /// Pending usage records before new ones are dropped
    pub usage_queue_capacity: usize,

    pub environment: String,

    /// Emit JSON log lines
    pub json_logs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            admin_api_key: String::new(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            forward_timeout: Duration::from_secs(30),
            max_request_bytes: 10 * 1024 * 1024,
            eager_deploy: false,
            sweep_interval: Duration::from_secs(300),
            rate_limit: RateLimitConfig::default(),
            counter_backend: CounterBackend::Redis,
            usage_queue_capacity: 1024,
            environment: "production".to_string(),
            json_logs: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let vars = Vars(&lookup);

        let limits = PlanLimits {
            free: vars.parse("RATE_LIMIT_FREE", defaults.rate_limit.limits.free)?,
            pro: vars.parse("RATE_LIMIT_PRO", defaults.rate_limit.limits.pro)?,
            enterprise: vars.parse(
                "RATE_LIMIT_ENTERPRISE",
                defaults.rate_limit.limits.enterprise,
            )?,
        };

        let failure_mode = match vars.get("RATE_LIMIT_FAILURE_MODE") {
            Some(raw) => raw
                .parse::<FailureMode>()
                .map_err(anyhow::Error::msg)
                .context("Invalid RATE_LIMIT_FAILURE_MODE")?,
            None => defaults.rate_limit.failure_mode,
        };

        let counter_backend = match vars.get("RATE_LIMIT_BACKEND") {
            Some(raw) => raw
                .parse::<CounterBackend>()
                .map_err(anyhow::Error::msg)
                .context("Invalid RATE_LIMIT_BACKEND")?,
            None => defaults.counter_backend,
        };

        let config = GatewayConfig {
            host: vars.get("GATEWAY_HOST").unwrap_or(defaults.host),
            port: vars.parse("GATEWAY_PORT", defaults.port)?,
            admin_api_key: vars.get("ADMIN_API_KEY").unwrap_or_default(),
            redis_url: vars.get("REDIS_URL").unwrap_or(defaults.redis_url),
            forward_timeout: Duration::from_secs(vars.parse(
                "FORWARD_TIMEOUT_SECS",
                defaults.forward_timeout.as_secs(),
            )?),
            max_request_bytes: vars.parse("MAX_REQUEST_BYTES", defaults.max_request_bytes)?,
            eager_deploy: vars.parse("EAGER_DEPLOY", defaults.eager_deploy)?,
            sweep_interval: Duration::from_secs(vars.parse(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            rate_limit: RateLimitConfig {
                limits,
                failure_mode,
                window_secs: defaults.rate_limit.window_secs,
            },
            counter_backend,
            usage_queue_capacity: vars.parse(
                "USAGE_QUEUE_CAPACITY",
                defaults.usage_queue_capacity,
            )?,
            environment: vars.get("ENVIRONMENT").unwrap_or(defaults.environment),
            json_logs: vars
                .get("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json_logs),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("GATEWAY_PORT must be greater than 0");
        }

        if self.admin_api_key.trim().is_empty() {
            anyhow::bail!("ADMIN_API_KEY must be set");
        }

        if self.forward_timeout.is_zero() {
            anyhow::bail!("FORWARD_TIMEOUT_SECS must be greater than 0");
        }

        if self.max_request_bytes == 0 {
            anyhow::bail!("MAX_REQUEST_BYTES must be greater than 0");
        }

        if self.usage_queue_capacity == 0 {
            anyhow::bail!("USAGE_QUEUE_CAPACITY must be greater than 0");
        }

        Ok(())
    }

    /// Get the gateway server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}", name)),
            None => Ok(default),
        }
    }
}
