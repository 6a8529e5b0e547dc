//! Prometheus metrics module
//!
//! The library only emits through the `metrics` facade; the binary installs
//! the Prometheus recorder. Without a recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ShardError;

/// Installed Prometheus recorder
#[derive(Clone)]
pub struct RouterMetrics {
    handle: Arc<PrometheusHandle>,
}

impl RouterMetrics {
    /// Install the process-wide recorder. Fails if one is already installed.
    pub fn install() -> Result<Self, ShardError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ShardError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "shard_router_route_decisions_total",
            Unit::Count,
            "Routing decisions by model, operation and route"
        );
        describe_counter!(
            "shard_router_shard_calls_total",
            Unit::Count,
            "Calls issued to individual shards"
        );
        describe_counter!(
            "shard_router_errors_total",
            Unit::Count,
            "Failed router operations"
        );
        describe_histogram!(
            "shard_router_fan_out_duration_seconds",
            Unit::Seconds,
            "Wall time of fanned-out operations"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a routing decision
pub fn record_route(model: &str, operation: &'static str, route: &'static str) {
    counter!(
        "shard_router_route_decisions_total",
        "model" => model.to_string(),
        "operation" => operation,
        "route" => route
    )
    .increment(1);
}

/// Record one call reaching a shard
pub fn record_shard_call(model: &str, shard: usize) {
    counter!(
        "shard_router_shard_calls_total",
        "model" => model.to_string(),
        "shard" => shard.to_string()
    )
    .increment(1);
}

/// Record a failed operation
pub fn record_error(model: &str, error_type: &'static str) {
    counter!(
        "shard_router_errors_total",
        "model" => model.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Record how long a fan-out took
pub fn record_fan_out_duration(model: &str, operation: &'static str, duration: Duration) {
    histogram!(
        "shard_router_fan_out_duration_seconds",
        "model" => model.to_string(),
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}
