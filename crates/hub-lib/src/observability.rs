//! Observability for the hub control plane
//!
//! Provides:
//! - Prometheus metrics for hub status, lifecycle operation latency and browser workers
//! - Structured event logging with tracing

use crate::settings::DeploymentMode;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for lifecycle operations, which range from a cached lookup to a
/// full image pull (seconds)
const OPERATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<HubMetricsInner> = OnceLock::new();

struct HubMetricsInner {
    hub_status: IntGaugeVec,
    operation_seconds: HistogramVec,
    browser_instances: IntGaugeVec,
    browser_creation_seconds: HistogramVec,
    browser_creation_errors: IntCounterVec,
}

impl HubMetricsInner {
    fn new() -> Self {
        Self {
            hub_status: register_int_gauge_vec!(
                "selenium_hub_status",
                "Selenium Hub status (1 = running, 0 = not running)",
                &["deployment_mode"]
            )
            .expect("Failed to register selenium_hub_status"),

            operation_seconds: register_histogram_vec!(
                "selenium_hub_operation_seconds",
                "Time spent on hub lifecycle operations",
                &["operation", "deployment_mode"],
                OPERATION_BUCKETS.to_vec()
            )
            .expect("Failed to register selenium_hub_operation_seconds"),

            browser_instances: register_int_gauge_vec!(
                "selenium_browser_instances",
                "Browser workers created through this control plane",
                &["browser_type", "deployment_mode"]
            )
            .expect("Failed to register selenium_browser_instances"),

            browser_creation_seconds: register_histogram_vec!(
                "selenium_browser_creation_seconds",
                "Time spent creating a batch of browser workers",
                &["browser_type", "deployment_mode"],
                OPERATION_BUCKETS.to_vec()
            )
            .expect("Failed to register selenium_browser_creation_seconds"),

            browser_creation_errors: register_int_counter_vec!(
                "selenium_browser_creation_errors_total",
                "Failed browser creation requests",
                &["browser_type", "deployment_mode", "error_type"]
            )
            .expect("Failed to register selenium_browser_creation_errors_total"),
        }
    }
}

/// Handle to the process-wide hub metrics. Clones share the same series.
#[derive(Clone)]
pub struct HubMetrics {
    mode: &'static str,
}

fn mode_label(mode: DeploymentMode) -> &'static str {
    match mode {
        DeploymentMode::Local => "local",
        DeploymentMode::Cluster => "cluster",
    }
}

impl HubMetrics {
    /// Metrics labelled with `mode` (registers the global series on first use)
    pub fn new(mode: DeploymentMode) -> Self {
        GLOBAL_METRICS.get_or_init(HubMetricsInner::new);
        Self {
            mode: mode_label(mode),
        }
    }

    fn inner(&self) -> &HubMetricsInner {
        GLOBAL_METRICS.get_or_init(HubMetricsInner::new)
    }

    pub fn set_hub_status(&self, running: bool) {
        self.inner()
            .hub_status
            .with_label_values(&[self.mode])
            .set(i64::from(running));
    }

    pub fn observe_operation(&self, operation: &str, duration_secs: f64) {
        self.inner()
            .operation_seconds
            .with_label_values(&[operation, self.mode])
            .observe(duration_secs);
    }

    /// Adjust the live worker gauge by `delta`
    pub fn add_browser_instances(&self, browser_type: &str, delta: i64) {
        self.inner()
            .browser_instances
            .with_label_values(&[browser_type, self.mode])
            .add(delta);
    }

    pub fn observe_browser_creation(&self, browser_type: &str, duration_secs: f64) {
        self.inner()
            .browser_creation_seconds
            .with_label_values(&[browser_type, self.mode])
            .observe(duration_secs);
    }

    pub fn inc_browser_creation_errors(&self, browser_type: &str, error_type: &str) {
        self.inner()
            .browser_creation_errors
            .with_label_values(&[browser_type, self.mode, error_type])
            .inc();
    }
}

/// Structured logger for control-plane events
#[derive(Clone)]
pub struct StructuredLogger {
    deployment_mode: DeploymentMode,
}

impl StructuredLogger {
    pub fn new(deployment_mode: DeploymentMode) -> Self {
        Self { deployment_mode }
    }

    pub fn log_startup(&self, version: &str, hub_url: &str) {
        info!(
            event = "service_started",
            deployment_mode = %self.deployment_mode,
            version = %version,
            hub_url = %hub_url,
            "Selenium Hub control plane started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            deployment_mode = %self.deployment_mode,
            reason = %reason,
            "Selenium Hub control plane shutting down"
        );
    }

    pub fn log_hub_status(&self, running: bool) {
        if running {
            info!(
                event = "hub_status",
                deployment_mode = %self.deployment_mode,
                running = true,
                "Selenium Hub is running"
            );
        } else {
            warn!(
                event = "hub_status",
                deployment_mode = %self.deployment_mode,
                running = false,
                "Selenium Hub is not running"
            );
        }
    }

    pub fn log_browsers_created(&self, browser_type: &str, requested: u32, ids: &[String]) {
        let created = ids.len();
        if created < requested as usize {
            warn!(
                event = "browsers_created",
                deployment_mode = %self.deployment_mode,
                browser_type = %browser_type,
                requested,
                created,
                ids = ?ids,
                "Created fewer browsers than requested"
            );
        } else {
            info!(
                event = "browsers_created",
                deployment_mode = %self.deployment_mode,
                browser_type = %browser_type,
                requested,
                created,
                ids = ?ids,
                "Created browsers"
            );
        }
    }

    pub fn log_browsers_deleted(&self, requested: usize, deleted: &[String]) {
        info!(
            event = "browsers_deleted",
            deployment_mode = %self.deployment_mode,
            requested,
            deleted = deleted.len(),
            ids = ?deleted,
            "Deleted browsers"
        );
    }
}
