//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here; pool metrics come from
//! `token_pool::metrics` through the same recorder.
//!
//! - `admin_requests_total` (counter): labels `route`, `method`, `status`
//! - `admin_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("admin_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// Histogram buckets make the duration metric render as `_bucket` lines
/// rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed admin request.
pub fn record_request(route: &str, method: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "admin_requests_total",
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("admin_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_does_not_panic_without_recorder() {
        record_request("/admin/pool", "GET", 200, 0.01);
    }

    #[test]
    fn record_request_renders_counter_and_buckets() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/admin/pick", "POST", 422, 0.003);

        let output = handle.render();
        assert!(output.contains("admin_requests_total"));
        assert!(output.contains("route=\"/admin/pick\""));
        assert!(output.contains("status=\"422\""));
        assert!(output.contains("admin_request_duration_seconds_bucket"));
        assert!(output.contains("le=\"0.005\""));
    }
}
