//! Prometheus metrics for the proxy.
//!
//! Every mux dispatch is counted and timed per handler pattern, backed by a
//! `prometheus::Registry` owned by `ProxyMetrics`.

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// All Prometheus metrics for the proxy.
///
/// Cheap to clone (all inner types are `Arc`-based).
#[derive(Clone)]
#[derive(Debug)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Total requests dispatched, by handler pattern/method/status code.
    pub http_requests_total: IntCounterVec,

    /// Request duration, by handler pattern.
    pub http_request_duration_seconds: HistogramVec,
}

impl ProxyMetrics {
    /// Create and register all metrics.
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("tenantproxy_http_requests_total", "Total requests handled"),
            &["handler", "method", "code"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("metric can be registered");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tenantproxy_http_request_duration_seconds",
                "Request duration including the upstream round-trip",
            ),
            &["handler"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("encoding metrics");
        String::from_utf8(buf).expect("metrics are valid UTF-8")
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_after_increment() {
        let metrics = ProxyMetrics::new();
        metrics
            .http_requests_total
            .with_label_values(&["/api/v1/query", "GET", "200"])
            .inc();
        let rendered = metrics.render();
        assert!(rendered.contains("tenantproxy_http_requests_total"));
        assert!(rendered.contains("handler=\"/api/v1/query\""));
    }
}
