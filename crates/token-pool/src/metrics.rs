//! Pool metrics
//!
//! Recorded through the `metrics` facade; the service binary installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.
//!
//! - `token_pool_picks_total` (counter): label `outcome` (`ok` or a rejection code)
//! - `token_pool_health_checks_total` (counter): label `result`
//! - `token_pool_auto_disabled_total` (counter)
//! - `token_pool_tokens` (gauge): label `state`

use crate::store::PoolCounts;

pub fn record_pick(outcome: &str) {
    metrics::counter!("token_pool_picks_total", "outcome" => outcome.to_string()).increment(1);
}

/// `result` is one of `live`, `dead`, `error`, `missing_region`.
pub fn record_health_check(result: &'static str) {
    metrics::counter!("token_pool_health_checks_total", "result" => result).increment(1);
}

pub fn record_auto_disabled(count: usize) {
    metrics::counter!("token_pool_auto_disabled_total").increment(count as u64);
}

pub fn set_pool_gauges(counts: &PoolCounts) {
    metrics::gauge!("token_pool_tokens", "state" => "total").set(counts.total as f64);
    metrics::gauge!("token_pool_tokens", "state" => "enabled").set(counts.enabled as f64);
    metrics::gauge!("token_pool_tokens", "state" => "live").set(counts.live as f64);
    metrics::gauge!("token_pool_tokens", "state" => "missing_region")
        .set(counts.missing_region as f64);
}
