//! Metrics collection and monitoring for the task grid
//!
//! Prometheus counters and gauges for the balancer, channel and schedule
//! subsystems. Everything is registered in a crate-owned registry, so
//! embedding applications keep their default registry to themselves.

use crate::core::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntGauge, Registry,
};
use std::time::Instant;

/// Crate metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Load-balancing metrics
pub struct BalancerMetrics {
    /// Total number of feedback events applied to bundlers
    pub feedback_events: IntCounter,
    /// Total number of tasks covered by feedback events
    pub feedback_tasks: IntCounter,
    /// Total number of bundle size changes observed after feedback
    pub size_changes: IntCounter,
    /// Number of bundlers currently attached to channels
    pub bundlers_active: IntGauge,
    /// Histogram of feedback processing durations in seconds
    pub feedback_duration: Histogram,
    /// Total number of bundler states written to persistence
    pub states_stored: IntCounter,
    /// Total number of bundlers resumed from a persisted state
    pub states_restored: IntCounter,
}

/// Class-loading channel metrics
pub struct ChannelMetrics {
    /// Total number of requests registered on a context
    pub requests_added: IntCounter,
    /// Total number of requests resolved with a definition
    pub requests_resolved: IntCounter,
    /// Total number of requests resolved with a failure state
    pub requests_failed: IntCounter,
    /// Total number of requests answered from the resource cache
    pub cache_hits: IntCounter,
    /// Total number of frames written to peers
    pub frames_sent: IntCounter,
    /// Total number of frames read from peers
    pub frames_received: IntCounter,
    /// Total bytes written to peers
    pub bytes_sent: IntCounter,
    /// Total bytes read from peers
    pub bytes_received: IntCounter,
}

/// Deferred action metrics
pub struct ScheduleMetrics {
    /// Total number of scheduled actions
    pub actions_scheduled: IntCounter,
    /// Total number of cancelled actions
    pub actions_cancelled: IntCounter,
    /// Total number of actions that ran to completion
    pub actions_executed: IntCounter,
    /// Total number of actions that panicked
    pub actions_failed: IntCounter,
    /// Number of actions waiting for their fire time
    pub actions_pending: IntGauge,
}

/// Centralized metrics collection for all subsystems
pub struct Metrics {
    /// Load-balancing metrics
    pub balancer: BalancerMetrics,
    /// Class-loading channel metrics
    pub channel: ChannelMetrics,
    /// Deferred action metrics
    pub schedule: ScheduleMetrics,
}

impl Metrics {
    /// Create a metrics instance registered in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            balancer: BalancerMetrics::new(registry)?,
            channel: ChannelMetrics::new(registry)?,
            schedule: ScheduleMetrics::new(registry)?,
        })
    }

    /// Get the global metrics instance, `None` if registration failed
    pub fn global() -> Option<&'static Metrics> {
        static INSTANCE: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new(&REGISTRY) {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!("Metrics disabled, registration failed: {}", e);
                None
            }
        });
        INSTANCE.as_ref()
    }
}

impl BalancerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            feedback_events: register_int_counter_with_registry!(
                "tg_feedback_events_total",
                "Total number of feedback events applied to bundlers",
                registry
            )?,
            feedback_tasks: register_int_counter_with_registry!(
                "tg_feedback_tasks_total",
                "Total number of tasks covered by feedback events",
                registry
            )?,
            size_changes: register_int_counter_with_registry!(
                "tg_bundle_size_changes_total",
                "Total number of bundle size changes after feedback",
                registry
            )?,
            bundlers_active: register_int_gauge_with_registry!(
                "tg_bundlers_active",
                "Number of bundlers attached to node channels",
                registry
            )?,
            feedback_duration: register_histogram_with_registry!(
                "tg_feedback_duration_seconds",
                "Duration of feedback processing in seconds",
                vec![0.000_001, 0.000_01, 0.000_1, 0.001, 0.01, 0.1],
                registry
            )?,
            states_stored: register_int_counter_with_registry!(
                "tg_bundler_states_stored_total",
                "Total number of bundler states written to persistence",
                registry
            )?,
            states_restored: register_int_counter_with_registry!(
                "tg_bundler_states_restored_total",
                "Total number of bundlers resumed from a persisted state",
                registry
            )?,
        })
    }
}

impl ChannelMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            requests_added: register_int_counter_with_registry!(
                "tg_channel_requests_added_total",
                "Total number of resource requests registered",
                registry
            )?,
            requests_resolved: register_int_counter_with_registry!(
                "tg_channel_requests_resolved_total",
                "Total number of resource requests resolved with a definition",
                registry
            )?,
            requests_failed: register_int_counter_with_registry!(
                "tg_channel_requests_failed_total",
                "Total number of resource requests resolved with a failure",
                registry
            )?,
            cache_hits: register_int_counter_with_registry!(
                "tg_channel_cache_hits_total",
                "Total number of resource requests served from cache",
                registry
            )?,
            frames_sent: register_int_counter_with_registry!(
                "tg_channel_frames_sent_total",
                "Total frames sent",
                registry
            )?,
            frames_received: register_int_counter_with_registry!(
                "tg_channel_frames_received_total",
                "Total frames received",
                registry
            )?,
            bytes_sent: register_int_counter_with_registry!(
                "tg_channel_bytes_sent_total",
                "Total bytes sent",
                registry
            )?,
            bytes_received: register_int_counter_with_registry!(
                "tg_channel_bytes_received_total",
                "Total bytes received",
                registry
            )?,
        })
    }
}

impl ScheduleMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            actions_scheduled: register_int_counter_with_registry!(
                "tg_actions_scheduled_total",
                "Total number of scheduled actions",
                registry
            )?,
            actions_cancelled: register_int_counter_with_registry!(
                "tg_actions_cancelled_total",
                "Total number of cancelled actions",
                registry
            )?,
            actions_executed: register_int_counter_with_registry!(
                "tg_actions_executed_total",
                "Total number of actions run to completion",
                registry
            )?,
            actions_failed: register_int_counter_with_registry!(
                "tg_actions_failed_total",
                "Total number of actions that panicked",
                registry
            )?,
            actions_pending: register_int_gauge_with_registry!(
                "tg_actions_pending",
                "Number of actions waiting for their fire time",
                registry
            )?,
        })
    }
}

/// Run `f` against the global metrics, if they are available
pub fn record<F: FnOnce(&Metrics)>(f: F) {
    if let Some(metrics) = Metrics::global() {
        f(metrics);
    }
}

/// Timer for measuring operation duration with automatic histogram recording
pub struct Timer {
    /// Start time of the operation
    start: Instant,
    /// Histogram to record the duration when finished
    histogram: Histogram,
}

impl Timer {
    /// Start a new timer
    pub fn start(histogram: Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Initialize the metrics registry by creating the global metrics instance
pub fn init_registry() {
    let _ = Metrics::global();
}

/// Get the crate's Prometheus registry
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Collect and return all metrics as a Prometheus-formatted string
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
