use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: Operation,
    pub outcome: Outcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Operation {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    /// Download served from the store.
    Hit,
    /// Download of an unknown hash.
    Miss,
    /// Upload written to the store.
    Stored,
    /// Upload refused because the hash already exists.
    Conflict,
    /// Rejected by the auth gate or by the store.
    Forbidden,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: Operation,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthFailureLabels {
    pub reason: AuthFailureReason,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthFailureReason {
    /// No usable `Bearer` credential was sent.
    Missing,
    /// A token was sent but did not match.
    Invalid,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<OperationLabels, Histogram>,
    pub auth_failures_total: Family<AuthFailureLabels, Counter>,
    pub upload_bytes: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "nxcache_requests",
            "Cache requests by operation and outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<OperationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "nxcache_request_duration_seconds",
            "Cache request latency in seconds",
            request_duration_seconds.clone(),
        );

        let auth_failures_total = Family::<AuthFailureLabels, Counter>::default();
        registry.register(
            "nxcache_auth_failures",
            "Requests rejected by the bearer-token check",
            auth_failures_total.clone(),
        );

        let upload_bytes = Counter::default();
        registry.register(
            "nxcache_upload_bytes",
            "Total artifact bytes written to the store",
            upload_bytes.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            auth_failures_total,
            upload_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn record_request(&self, operation: Operation, outcome: Outcome, elapsed: Duration) {
        self.metrics
            .requests_total
            .get_or_create(&RequestLabels { operation, outcome })
            .inc();
        self.metrics
            .request_duration_seconds
            .get_or_create(&OperationLabels { operation })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_auth_failure(&self, reason: AuthFailureReason) {
        self.metrics
            .auth_failures_total
            .get_or_create(&AuthFailureLabels { reason })
            .inc();
    }

    pub fn record_upload_bytes(&self, bytes: usize) {
        self.metrics.upload_bytes.inc_by(bytes as u64);
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
