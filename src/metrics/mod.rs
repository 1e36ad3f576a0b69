//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so the free functions below
//! are no-ops until [`GatewayMetrics::install`] registers a recorder.

use crate::error::GatewayError;
use crate::shard::{ShardState, ShardStatus};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Handle to the installed Prometheus recorder
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Install the process-wide Prometheus recorder.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::MetricsInstall(Box::new(e)))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by reason"
        );
        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Time between a heartbeat and its acknowledgement"
        );
        describe_gauge!(
            "gateway_shard_status",
            Unit::Count,
            "Current shard status (1 for the active status label)"
        );
        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );

        describe_counter!(
            "rest_requests_total",
            Unit::Count,
            "REST requests by route template and status"
        );
        describe_histogram!(
            "rest_request_duration_seconds",
            Unit::Seconds,
            "REST request round-trip time"
        );
        describe_counter!(
            "rest_rate_limited_total",
            Unit::Count,
            "429 responses by scope"
        );
        describe_histogram!(
            "rest_bucket_wait_seconds",
            Unit::Seconds,
            "Time spent waiting for a rate-limit bucket"
        );
        describe_gauge!(
            "rest_buckets",
            Unit::Count,
            "Live rate-limit buckets"
        );
    }

    /// Refresh gauges derived from shard state
    pub fn observe_shards(&self, state: &ShardState) {
        gauge!("gateway_shards_ready").set(state.ready_shards() as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a dispatch event
pub fn record_event(shard_id: u32, event_name: &str) {
    counter!(
        "gateway_events_received_total",
        "shard_id" => shard_id.to_string(),
        "event_type" => event_name.to_ascii_lowercase()
    )
    .increment(1);
}

pub fn record_heartbeat_latency(shard_id: u32, latency: Duration) {
    histogram!(
        "gateway_heartbeat_latency_seconds",
        "shard_id" => shard_id.to_string()
    )
    .record(latency.as_secs_f64());
}

pub fn record_reconnect(shard_id: u32, reason: &'static str) {
    counter!(
        "gateway_reconnects_total",
        "shard_id" => shard_id.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// One gauge per status; the current one is 1, the rest 0.
pub fn record_shard_status(shard_id: u32, status: ShardStatus) {
    for candidate in ShardStatus::ALL {
        gauge!(
            "gateway_shard_status",
            "shard_id" => shard_id.to_string(),
            "status" => candidate.as_str()
        )
        .set(if candidate == status { 1.0 } else { 0.0 });
    }
}

/// Record a REST round trip; status 0 means no response arrived.
pub fn record_rest_request(template: &'static str, status: u16, elapsed: Duration) {
    counter!(
        "rest_requests_total",
        "route" => template,
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("rest_request_duration_seconds", "route" => template).record(elapsed.as_secs_f64());
}

pub fn record_rate_limited(global: bool) {
    counter!(
        "rest_rate_limited_total",
        "scope" => if global { "global" } else { "bucket" }
    )
    .increment(1);
}

pub fn record_bucket_wait(template: &'static str, waited: Duration) {
    histogram!("rest_bucket_wait_seconds", "route" => template).record(waited.as_secs_f64());
}

pub fn set_rest_buckets(count: usize) {
    gauge!("rest_buckets").set(count as f64);
}
