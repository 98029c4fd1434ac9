//! Prometheus metric families shared by the limiter and the admission service.
//!
//! [`Metrics`] is built once at startup and handed to each component; nothing is
//! registered in the process-global default registry.

use prometheus::{
    GaugeVec, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

const NAMESPACE: &str = "ratelimiter";

const REQUEST_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

const STORE_BUCKETS: &[f64] = &[0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1];

/// Metric families for admission decisions and store round trips.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    pub(crate) requests_total: IntCounterVec,
    pub(crate) request_duration_seconds: HistogramVec,
    pub(crate) redis_latency_seconds: HistogramVec,
    pub(crate) redis_errors_total: IntCounter,
    pub(crate) tokens_remaining: GaugeVec,
    pub(crate) internal_errors_total: IntCounterVec,
}

impl Metrics {
    /// Create the metric families in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create the metric families and register them into `registry`.
    ///
    /// # Errors
    /// Returns an error if a family cannot be registered (e.g. name conflict).
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "requests_total",
                "Total rate limit requests by key_prefix and decision.",
            )
            .namespace(NAMESPACE),
            &["key_prefix", "decision"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Histogram of RPC latencies.")
                .namespace(NAMESPACE)
                .buckets(REQUEST_BUCKETS.to_vec()),
            &["method"],
        )?;
        let redis_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "redis_latency_seconds",
                "Histogram of store round-trip latencies.",
            )
            .namespace(NAMESPACE)
            .buckets(STORE_BUCKETS.to_vec()),
            &["command"],
        )?;
        let redis_errors_total = IntCounter::with_opts(
            Opts::new("redis_errors_total", "Total store errors.").namespace(NAMESPACE),
        )?;
        let tokens_remaining = GaugeVec::new(
            Opts::new(
                "tokens_remaining",
                "Last observed remaining tokens (sampled).",
            )
            .namespace(NAMESPACE),
            &["key_prefix"],
        )?;
        let internal_errors_total = IntCounterVec::new(
            Opts::new(
                "internal_errors_total",
                "Internal (non-rate-limit) errors.",
            )
            .namespace(NAMESPACE),
            &["method", "error_type"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(redis_latency_seconds.clone()))?;
        registry.register(Box::new(redis_errors_total.clone()))?;
        registry.register(Box::new(tokens_remaining.clone()))?;
        registry.register(Box::new(internal_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            redis_latency_seconds,
            redis_errors_total,
            tokens_remaining,
            internal_errors_total,
        })
    }

    /// Expose the registry for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    /// Observes into `redis_latency_seconds{command}` when dropped.
    pub(crate) fn store_timer(&self, command: &str) -> HistogramTimer {
        self.redis_latency_seconds
            .with_label_values(&[command])
            .start_timer()
    }

    pub(crate) fn inc_store_errors(&self) {
        self.redis_errors_total.inc();
    }

    /// Observes into `request_duration_seconds{method}` when dropped.
    pub(crate) fn request_timer(&self, method: &str) -> HistogramTimer {
        self.request_duration_seconds
            .with_label_values(&[method])
            .start_timer()
    }

    pub(crate) fn record_decision(&self, key_prefix: &str, allowed: bool, remaining: i64) {
        let decision = if allowed { "allowed" } else { "denied" };
        self.requests_total
            .with_label_values(&[key_prefix, decision])
            .inc();
        self.tokens_remaining
            .with_label_values(&[key_prefix])
            .set(remaining as f64);
    }

    pub(crate) fn inc_internal_error(&self, method: &str, error_type: &str) {
        self.internal_errors_total
            .with_label_values(&[method, error_type])
            .inc();
    }
}
