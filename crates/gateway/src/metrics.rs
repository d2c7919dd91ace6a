use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static GATE_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DRY_RUN_ESTIMATED_BYTES: OnceLock<HistogramVec> = OnceLock::new();
static QUOTA_COMPLETIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static UPSTREAM_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bqproxy_http_requests_total",
                    "Proxy HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create bqproxy_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "bqproxy_http_request_duration_seconds",
                    "Proxy HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create bqproxy_http_request_duration_seconds"),
        )
    })
}

fn gate_rejections_total() -> &'static IntCounterVec {
    GATE_REJECTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bqproxy_gate_rejections_total",
                    "Query submissions refused before execution.",
                ),
                &["reason"],
            )
            .expect("create bqproxy_gate_rejections_total"),
        )
    })
}

fn dry_run_estimated_bytes() -> &'static HistogramVec {
    DRY_RUN_ESTIMATED_BYTES.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "bqproxy_dry_run_estimated_bytes",
                    "Bytes the warehouse estimated a query would scan.",
                )
                .buckets(prometheus::exponential_buckets(1_048_576.0, 4.0, 10).unwrap_or_default()),
                &["query_id"],
            )
            .expect("create bqproxy_dry_run_estimated_bytes"),
        )
    })
}

fn quota_completions_total() -> &'static IntCounterVec {
    QUOTA_COMPLETIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bqproxy_quota_completions_total",
                    "Completed jobs reported to the quota ledger.",
                ),
                &["outcome"],
            )
            .expect("create bqproxy_quota_completions_total"),
        )
    })
}

fn upstream_requests_total() -> &'static IntCounterVec {
    UPSTREAM_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bqproxy_upstream_requests_total",
                    "Requests sent to the warehouse API.",
                ),
                &["operation", "status"],
            )
            .expect("create bqproxy_upstream_requests_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_gate_rejection(reason: &str) {
    gate_rejections_total().with_label_values(&[reason]).inc();
}

pub fn observe_dry_run_estimate(query_id: &str, bytes: u64) {
    dry_run_estimated_bytes()
        .with_label_values(&[query_id])
        .observe(bytes as f64);
}

pub fn observe_quota_completion(outcome: &str) {
    quota_completions_total().with_label_values(&[outcome]).inc();
}

/// `status` is the upstream HTTP status, or `timeout` / `transport` /
/// `credentials` when no response arrived.
pub fn observe_upstream_request(operation: &str, status: &str) {
    upstream_requests_total()
        .with_label_values(&[operation, status])
        .inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = gate_rejections_total();
    let _ = quota_completions_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_observed_series() {
        observe_gate_rejection("daily_quota_exceeded");
        observe_upstream_request("insert_job", "200");

        let (body, content_type) = render().expect("render");
        let text = String::from_utf8(body).expect("utf8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("bqproxy_gate_rejections_total{reason=\"daily_quota_exceeded\"}"));
        assert!(text.contains("bqproxy_upstream_requests_total"));
    }
}
