//! Prometheus counters and the `/metrics` + `/robots.txt` endpoints.
//!
//! Gated by `security.enable_prometheus`-equivalent `metrics.enable_prometheus`
//! (spec.md keeps the metrics *subsystem* itself out of scope — no
//! histograms, no per-country labels as the original's GeoIP-backed
//! dashboards have — but these eight named counters are ambient
//! observability wiring the teacher already depends on `prometheus` for).

use prometheus::{IntCounter, Registry};

use crate::{body::CacheBody, types::Response};

pub struct Metrics {
    registry: Registry,
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub dropped: IntCounter,
    pub skipped: IntCounter,
    pub refreshed: IntCounter,
    pub corrupted: IntCounter,
    pub failed: IntCounter,
    pub requests: IntCounter,
    pub served_bytes: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::new($name, $help).expect("valid metric name");
                registry.register(Box::new(c.clone())).expect("unique metric name");
                c
            }};
        }

        Self {
            hits: counter!("cachenode_hits_total", "cache hits served"),
            misses: counter!("cachenode_misses_total", "cache misses fetched from origin"),
            dropped: counter!("cachenode_dropped_total", "requests rejected before cache lookup"),
            skipped: counter!("cachenode_skipped_total", "requests short-circuited by If-Modified-Since"),
            refreshed: counter!("cachenode_refreshed_total", "cache entries force-refreshed by a visitor"),
            corrupted: counter!("cachenode_corrupted_total", "cache hits that failed integrity verification"),
            failed: counter!("cachenode_failed_total", "requests that failed during origin fetch or save"),
            requests: counter!("cachenode_requests_total", "requests admitted past shape validation"),
            served_bytes: counter!("cachenode_served_bytes_total", "bytes streamed to clients"),
            registry,
        }
    }

    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("metric encoding cannot fail");
        String::from_utf8(buf).expect("prometheus text format is utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub static ROBOTS_TXT: &str = "User-Agent: *\nDisallow: /\n";

/// `/robots.txt` handler: cache nodes are not meant to be indexed.
pub async fn robots_txt() -> Response {
    hyper::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(CacheBody::from(ROBOTS_TXT))
        .expect("static robots.txt response is well-formed")
}

pub fn metrics_response(metrics: &Metrics) -> Response {
    hyper::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(CacheBody::from(metrics.render()))
        .expect("metrics response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = Metrics::new();
        assert_eq!(metrics.hits.get(), 0);
        metrics.hits.inc();
        assert_eq!(metrics.hits.get(), 1);
    }

    #[test]
    fn render_includes_all_named_counters() {
        let metrics = Metrics::new();
        let rendered = metrics.render();
        for name in [
            "cachenode_hits_total",
            "cachenode_misses_total",
            "cachenode_dropped_total",
            "cachenode_skipped_total",
            "cachenode_refreshed_total",
            "cachenode_corrupted_total",
            "cachenode_failed_total",
            "cachenode_requests_total",
            "cachenode_served_bytes_total",
        ] {
            assert!(rendered.contains(name), "missing {name} in rendered metrics");
        }
    }

    #[tokio::test]
    async fn robots_txt_disallows_everything() {
        let response = robots_txt().await;
        assert_eq!(response.status(), http::StatusCode::OK);
    }
}
