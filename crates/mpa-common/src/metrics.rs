//! Prometheus metrics for the autoscaler binaries
//!
//! Exposes:
//! - admission pod counters and latency
//! - per-step execution latency of the recommender and updater loops
//!
//! Series names are part of the deployed dashboards, including the
//! historical `exection_latency_seconds` spelling.

use std::net::SocketAddr;
use std::time::Instant;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use tracing::{error, info};

/// Buckets for loop step durations, in seconds
const EXECUTION_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0,
    80.0, 90.0, 100.0, 120.0, 150.0, 240.0, 300.0,
];

/// Buckets for admission request handling, in seconds
const ADMISSION_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0,
];

// ============================================================================
// Admission metrics
// ============================================================================

/// Counter of pods handled by the admission webhook
///
/// Labels:
/// - `applied`: "true" when a patch was produced
static ADMISSION_POD_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mpa_admission_admission_pods_total",
        "Pods handled by the admission webhook",
        &["applied"]
    )
    .expect("Failed to register mpa_admission_admission_pods_total")
});

/// Histogram of admission request handling latency
///
/// Labels:
/// - `status`: applied, skipped, error
/// - `resource`: pod, unknown
static ADMISSION_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mpa_admission_admission_latency_seconds",
        "Time spent handling one admission request",
        &["status", "resource"],
        ADMISSION_BUCKETS.to_vec()
    )
    .expect("Failed to register mpa_admission_admission_latency_seconds")
});

// ============================================================================
// Loop metrics
// ============================================================================

/// Histogram of recommender loop step durations
static RECOMMENDER_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mpa_recommender_exection_latency_seconds",
        "Time spent in each step of the recommender loop",
        &["step"],
        EXECUTION_BUCKETS.to_vec()
    )
    .expect("Failed to register mpa_recommender_exection_latency_seconds")
});

/// Histogram of updater loop step durations
static UPDATER_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mpa_updater_exection_latency_seconds",
        "Time spent in each step of the updater loop",
        &["step"],
        EXECUTION_BUCKETS.to_vec()
    )
    .expect("Failed to register mpa_updater_exection_latency_seconds")
});

// ============================================================================
// Label types
// ============================================================================

/// Outcome of one admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    /// A patch was produced and returned
    Applied,
    /// The request was valid but produced no patch
    Skipped,
    /// Handling failed; the request was allowed unchanged
    Error,
}

impl AdmissionStatus {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// Resource named by an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResource {
    /// A core/v1 pod
    Pod,
    /// Anything else
    Unknown,
}

impl AdmissionResource {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Unknown => "unknown",
        }
    }
}

/// Count one admitted pod; `applied` says whether a patch was produced
pub fn on_admitted_pod(applied: bool) {
    ADMISSION_POD_COUNT
        .with_label_values(&[if applied { "true" } else { "false" }])
        .inc();
}

// ============================================================================
// Timers
// ============================================================================

/// Measures one admission request from creation to `observe()`
pub struct AdmissionTimer {
    start: Instant,
}

impl AdmissionTimer {
    /// Start timing; created at the top of the request handler
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the elapsed time under the final status and resource
    pub fn observe(self, status: AdmissionStatus, resource: AdmissionResource) {
        ADMISSION_LATENCY
            .with_label_values(&[status.as_str(), resource.as_str()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Measures the steps of one loop tick:
///
/// 1. `let mut timer = ExecutionTimer::recommender();`
/// 2. work, then `timer.observe_step("GetMPAs")`
/// 3. ... more steps ...
/// 4. `timer.observe_total()`
pub struct ExecutionTimer {
    histogram: &'static HistogramVec,
    start: Instant,
    last: Instant,
}

impl ExecutionTimer {
    /// Timer feeding the recommender latency series
    pub fn recommender() -> Self {
        Self::new(&RECOMMENDER_LATENCY)
    }

    /// Timer feeding the updater latency series
    pub fn updater() -> Self {
        Self::new(&UPDATER_LATENCY)
    }

    fn new(histogram: &'static HistogramVec) -> Self {
        let now = Instant::now();
        Self {
            histogram,
            start: now,
            last: now,
        }
    }

    /// Record the time since the previous step boundary under `step`
    pub fn observe_step(&mut self, step: &str) {
        let now = Instant::now();
        self.histogram
            .with_label_values(&[step])
            .observe((now - self.last).as_secs_f64());
        self.last = now;
    }

    /// Record the time since the timer was created under `total`
    pub fn observe_total(self) {
        self.histogram
            .with_label_values(&["total"])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

// ============================================================================
// Exposition
// ============================================================================

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
    }
    (
        [("content-type", prometheus::TEXT_FORMAT)],
        buffer,
    )
}

/// Build the metrics router (`/metrics` + `/healthz`)
pub fn metrics_routes() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
}

/// Serve `/metrics` on `addr` in the background
pub fn serve_metrics(addr: SocketAddr) {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(addr = %addr, "Metrics endpoint started");
                listener
            }
            Err(e) => {
                error!(error = %e, addr = %addr, "Failed to bind metrics endpoint");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, metrics_routes()).await {
            error!(error = %e, "Metrics server error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels() {
        assert_eq!(AdmissionStatus::Applied.as_str(), "applied");
        assert_eq!(AdmissionStatus::Skipped.as_str(), "skipped");
        assert_eq!(AdmissionStatus::Error.as_str(), "error");
        assert_eq!(AdmissionResource::Pod.as_str(), "pod");
    }

    #[test]
    fn admission_counter_accepts_both_labels() {
        on_admitted_pod(true);
        on_admitted_pod(false);
    }

    #[test]
    fn execution_timer_records_steps() {
        let mut timer = ExecutionTimer::updater();
        timer.observe_step("GetMPAs");
        timer.observe_step("GetPods");
        timer.observe_total();
    }

    #[test]
    fn admission_timer_records() {
        let timer = AdmissionTimer::start();
        timer.observe(AdmissionStatus::Skipped, AdmissionResource::Pod);
    }
}
