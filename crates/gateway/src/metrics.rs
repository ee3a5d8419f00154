//! Gateway request metrics
//!
//! Counters and a latency histogram live in a prometheus [`Registry`]; the
//! JSON summary served by `/metrics` is read back from the same collectors.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::time::{Duration, Instant};

const NAMESPACE: &str = "genapi_gateway";

/// Request latency buckets, in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

pub struct Metrics {
    started: Instant,
    registry: Registry,
    requests_total: IntCounter,
    errors_total: IntCounter,
    responses_total: IntCounterVec,
    request_duration_seconds: Histogram,
    deployed_apis: IntGauge,
    registered_apis: IntGauge,
}

/// Point-in-time view served by `/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
}

impl Metrics {
    /// Create the collectors and register them in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(
            Opts::new("requests_total", "Requests handled by the gateway").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = IntCounter::with_opts(
            Opts::new("errors_total", "Requests answered with a 4xx or 5xx status")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let responses_total = IntCounterVec::new(
            Opts::new("responses_total", "Responses by status code").namespace(NAMESPACE),
            &["status"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("request_duration_seconds", "Request processing time")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let deployed_apis = IntGauge::with_opts(
            Opts::new("deployed_apis", "APIs with a running deployment").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(deployed_apis.clone()))?;

        let registered_apis = IntGauge::with_opts(
            Opts::new("registered_apis", "APIs loaded in the registry").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(registered_apis.clone()))?;

        Ok(Self {
            started: Instant::now(),
            registry,
            requests_total,
            errors_total,
            responses_total,
            request_duration_seconds,
            deployed_apis,
            registered_apis,
        })
    }

    /// Count one handled request; any 4xx or 5xx status is an error
    pub fn record(&self, elapsed: Duration, status: u16) {
        self.requests_total.inc();
        let status_label = status.to_string();
        self.responses_total
            .with_label_values(&[status_label.as_str()])
            .inc();
        self.request_duration_seconds.observe(elapsed.as_secs_f64());
        if status >= 400 {
            self.errors_total.inc();
        }
    }

    /// Update the registry-derived gauges
    pub fn set_api_counts(&self, deployed: usize, registered: usize) {
        self.deployed_apis
            .set(i64::try_from(deployed).unwrap_or(i64::MAX));
        self.registered_apis
            .set(i64::try_from(registered).unwrap_or(i64::MAX));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.requests_total.get();
        let errors = self.errors_total.get();
        let count = self.request_duration_seconds.get_sample_count();
        let sum_secs = self.request_duration_seconds.get_sample_sum();

        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };
        let avg_ms = if count == 0 {
            0.0
        } else {
            sum_secs / count as f64 * 1000.0
        };

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: total,
            total_errors: errors,
            error_rate,
            avg_response_time_ms: (avg_ms * 100.0).round() / 100.0,
        }
    }

    /// Prometheus text exposition of every collector
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
