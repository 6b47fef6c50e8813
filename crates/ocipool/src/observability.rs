//! Observability infrastructure for the instance pool manager
//!
//! Provides:
//! - Prometheus metrics (refresh latency and errors, target sizes, scaling and detach counts)
//! - Structured event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for refresh latency (in seconds)
const REFRESH_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<PoolMetricsInner> = OnceLock::new();

struct PoolMetricsInner {
    refresh_latency_seconds: Histogram,
    refresh_errors: IntCounter,
    target_size: IntGaugeVec,
    scale_requests: IntCounterVec,
    instances_detached: IntCounterVec,
    resolver_lookups: IntCounterVec,
}

impl PoolMetricsInner {
    fn new() -> Self {
        Self {
            refresh_latency_seconds: register_histogram!(
                "ocipool_refresh_latency_seconds",
                "Time spent rebuilding the instance pool cache",
                REFRESH_BUCKETS.to_vec()
            )
            .expect("Failed to register refresh_latency_seconds"),

            refresh_errors: register_int_counter!(
                "ocipool_refresh_errors_total",
                "Total number of failed cache refreshes"
            )
            .expect("Failed to register refresh_errors"),

            target_size: register_int_gauge_vec!(
                "ocipool_target_size",
                "Target size of each managed instance pool",
                &["pool_id"]
            )
            .expect("Failed to register target_size"),

            scale_requests: register_int_counter_vec!(
                "ocipool_scale_requests_total",
                "Resize requests issued to the vendor by outcome",
                &["pool_id", "outcome"]
            )
            .expect("Failed to register scale_requests"),

            instances_detached: register_int_counter_vec!(
                "ocipool_instances_detached_total",
                "Instances detached from managed pools",
                &["pool_id"]
            )
            .expect("Failed to register instances_detached"),

            resolver_lookups: register_int_counter_vec!(
                "ocipool_resolver_lookups_total",
                "Node to pool resolutions by outcome",
                &["outcome"]
            )
            .expect("Failed to register resolver_lookups"),
        }
    }
}

/// Outcome label of a node to pool resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Answered from static specs or annotations
    Cached,
    Resolved,
    NotMember,
    Error,
}

impl LookupOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Cached => "cached",
            LookupOutcome::Resolved => "resolved",
            LookupOutcome::NotMember => "not_member",
            LookupOutcome::Error => "error",
        }
    }
}

/// Handle to the process-wide pool metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct PoolMetrics {
    _private: (),
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PoolMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PoolMetricsInner {
        GLOBAL_METRICS.get_or_init(PoolMetricsInner::new)
    }

    pub fn observe_refresh(&self, duration_secs: f64) {
        self.inner().refresh_latency_seconds.observe(duration_secs);
    }

    pub fn inc_refresh_errors(&self) {
        self.inner().refresh_errors.inc();
    }

    pub fn set_target_size(&self, pool_id: &str, size: usize) {
        self.inner()
            .target_size
            .with_label_values(&[pool_id])
            .set(size as i64);
    }

    pub fn inc_scale_requests(&self, pool_id: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .scale_requests
            .with_label_values(&[pool_id, outcome])
            .inc();
    }

    pub fn inc_instances_detached(&self, pool_id: &str) {
        self.inner()
            .instances_detached
            .with_label_values(&[pool_id])
            .inc();
    }

    pub fn inc_resolver_lookups(&self, outcome: LookupOutcome) {
        self.inner()
            .resolver_lookups
            .with_label_values(&[outcome.as_str()])
            .inc();
    }
}

/// Structured logger for pool events
///
/// Emits an `event` field on every record so log pipelines can filter on it.
#[derive(Clone)]
pub struct PoolEventLogger {
    compartment_id: String,
}

impl PoolEventLogger {
    pub fn new(compartment_id: impl Into<String>) -> Self {
        Self {
            compartment_id: compartment_id.into(),
        }
    }

    /// Log a completed cache refresh
    pub fn log_refresh(&self, pools: usize, duration_ms: u64, next_refresh_secs: u64) {
        info!(
            event = "cache_refreshed",
            compartment_id = %self.compartment_id,
            pools = pools,
            duration_ms = duration_ms,
            next_refresh_secs = next_refresh_secs,
            "Instance pool cache refreshed"
        );
    }

    pub fn log_refresh_failed(&self, error: &str) {
        warn!(
            event = "cache_refresh_failed",
            compartment_id = %self.compartment_id,
            error = %error,
            "Failed to refresh instance pool cache"
        );
    }

    /// Log a resize request and its outcome
    pub fn log_scale(&self, pool_id: &str, from: usize, to: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "pool_scaled",
                compartment_id = %self.compartment_id,
                pool_id = %pool_id,
                from = from,
                to = to,
                "Instance pool resized"
            ),
            Some(error) => warn!(
                event = "pool_scale_failed",
                compartment_id = %self.compartment_id,
                pool_id = %pool_id,
                from = from,
                to = to,
                error = %error,
                "Instance pool resize failed"
            ),
        }
    }

    pub fn log_detach(&self, pool_id: &str, instance_id: &str, outcome: &str) {
        info!(
            event = "instance_detached",
            compartment_id = %self.compartment_id,
            pool_id = %pool_id,
            instance_id = %instance_id,
            outcome = %outcome,
            "Instance detach processed"
        );
    }

    /// Log a node matched to a managed pool
    pub fn log_node_resolved(&self, node: &str, instance_id: &str, pool_id: &str) {
        info!(
            event = "node_resolved",
            compartment_id = %self.compartment_id,
            node = %node,
            instance_id = %instance_id,
            pool_id = %pool_id,
            "Resolved node to instance pool"
        );
    }

    pub fn log_startup(&self, pools: usize) {
        info!(
            event = "manager_started",
            compartment_id = %self.compartment_id,
            pools = pools,
            "Instance pool manager started"
        );
    }
}
