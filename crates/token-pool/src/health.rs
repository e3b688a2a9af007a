//! Background token health checks
//!
//! Every interval, each enabled token is re-validated against the upstream.
//! A pass only ever moves tokens towards disablement: failures increment a
//! counter and tokens at the threshold are auto-disabled. Recovery of a
//! disabled token happens through a manual check (`sync_token_check_result`).
//!
//! Upstream calls run with no pool lock held. Results are written back by
//! token, so a token removed mid-pass is simply ignored. The pass persists
//! once at the end.

use std::sync::Arc;
use std::time::Duration;

use common::{RegionCode, mask_token};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use upstream::{CapabilitySnapshot, Upstream};

use crate::config::PoolConfig;
use crate::entry::{DynamicCapabilities, TokenEntry, now_millis};
use crate::error::Result;
use crate::manager::PoolManager;
use crate::metrics;

/// Outcome counts of one health-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckReport {
    /// Another pass was already running; nothing was checked.
    pub skipped: bool,
    pub checked: usize,
    pub live: usize,
    pub failed: usize,
    pub missing_region: usize,
    pub auto_disabled: usize,
}

impl HealthCheckReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Spawn the periodic health-check loop.
///
/// Each tick starts a pass in its own task, so a slow pass never delays the
/// timer; a tick that lands while a pass is still running is a no-op.
///
/// Passes are owned by the loop task. Aborting the returned handle also
/// aborts any pass still in flight.
pub fn spawn_health_check_task(
    manager: Arc<PoolManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut passes = JoinSet::new();
        // Skip the immediate first tick, the pool was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            while passes.try_join_next().is_some() {}
            let manager = Arc::clone(&manager);
            passes.spawn(async move {
                match manager.run_health_check().await {
                    Ok(report) if report.skipped => {
                        debug!("health check still running, skipped timer fire");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "health check pass failed to persist");
                    }
                }
            });
        }
    })
}

struct ProbeTarget {
    token: String,
    region: Option<RegionCode>,
    refresh_capabilities: bool,
}

enum ProbeOutcome {
    MissingRegion,
    Live {
        credit: Option<std::result::Result<i64, String>>,
        capabilities: Option<std::result::Result<CapabilitySnapshot, String>>,
    },
    NotLive,
    Failed(String),
}

impl ProbeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::MissingRegion => "missing_region",
            ProbeOutcome::Live { .. } => "live",
            ProbeOutcome::NotLive => "dead",
            ProbeOutcome::Failed(_) => "error",
        }
    }
}

/// Run one pass. Callers hold the manager's health-check guard.
pub(crate) async fn run_pass(manager: &PoolManager) -> Result<HealthCheckReport> {
    let config = &manager.config;
    let started = now_millis();

    let targets: Vec<ProbeTarget> = {
        let store = manager.store.read().await;
        store
            .entries()
            .iter()
            .filter(|e| e.enabled)
            .map(|e| ProbeTarget {
                token: e.token.clone(),
                region: e.region,
                refresh_capabilities: e.capabilities_stale(started),
            })
            .collect()
    };

    info!(tokens = targets.len(), "starting token health check");

    let mut report = HealthCheckReport::default();
    for target in targets {
        let outcome = probe(manager.upstream.as_ref(), config, &target).await;
        metrics::record_health_check(outcome.label());
        report.checked += 1;
        match &outcome {
            ProbeOutcome::Live { .. } => report.live += 1,
            ProbeOutcome::MissingRegion => report.missing_region += 1,
            ProbeOutcome::NotLive | ProbeOutcome::Failed(_) => report.failed += 1,
        }

        let mut store = manager.store.write().await;
        match store.get_mut(&target.token) {
            Some(entry) => apply_outcome(entry, outcome, now_millis()),
            None => debug!(
                token = %mask_token(&target.token),
                "token removed during health check, dropping result"
            ),
        }
    }

    if config.auto_disable {
        let mut store = manager.store.write().await;
        let disabled = auto_disable(store.entries_mut(), config.failure_threshold());
        for token in &disabled {
            warn!(
                token = %mask_token(token),
                threshold = config.failure_threshold(),
                "token auto-disabled after consecutive failed checks"
            );
        }
        report.auto_disabled = disabled.len();
        metrics::record_auto_disabled(disabled.len());
    }

    manager.update_gauges().await;
    manager.persist().await?;

    info!(
        checked = report.checked,
        live = report.live,
        failed = report.failed,
        missing_region = report.missing_region,
        auto_disabled = report.auto_disabled,
        elapsed_ms = now_millis().saturating_sub(started),
        "token health check finished"
    );
    Ok(report)
}

async fn probe(upstream: &dyn Upstream, config: &PoolConfig, target: &ProbeTarget) -> ProbeOutcome {
    // Never contact the upstream without knowing which region to ask.
    let Some(region) = target.region else {
        return ProbeOutcome::MissingRegion;
    };

    match upstream.token_live_status(&target.token, region).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(token = %mask_token(&target.token), %region, "token rejected by upstream");
            return ProbeOutcome::NotLive;
        }
        Err(e) => {
            warn!(
                token = %mask_token(&target.token),
                %region,
                kind = e.kind(),
                error = %e,
                "token liveness check failed"
            );
            return ProbeOutcome::Failed(e.to_string());
        }
    }

    let credit = if config.fetch_credit_on_check {
        Some(fetch_credit(upstream, config, &target.token, region).await)
    } else {
        None
    };

    let capabilities = if target.refresh_capabilities {
        Some(
            upstream
                .capabilities(&target.token, region)
                .await
                .map_err(|e| {
                    warn!(
                        token = %mask_token(&target.token),
                        %region,
                        kind = e.kind(),
                        error = %e,
                        "capability refresh failed"
                    );
                    e.to_string()
                }),
        )
    } else {
        None
    };

    ProbeOutcome::Live {
        credit,
        capabilities,
    }
}

/// Credit balance, claiming the daily grant first when the balance is empty
/// and claiming is enabled. A failed claim keeps the observed balance.
async fn fetch_credit(
    upstream: &dyn Upstream,
    config: &PoolConfig,
    token: &str,
    region: RegionCode,
) -> std::result::Result<i64, String> {
    let credit = upstream.credit(token, region).await.map_err(|e| {
        warn!(token = %mask_token(token), %region, kind = e.kind(), error = %e, "credit check failed");
        e.to_string()
    })?;
    if credit.total() > 0 || !config.claim_credit_when_empty {
        return Ok(credit.total());
    }

    match upstream.receive_credit(token, region).await {
        Ok(after) => {
            info!(token = %mask_token(token), credit = after.total(), "claimed daily credit");
            Ok(after.total())
        }
        Err(e) => {
            warn!(token = %mask_token(token), kind = e.kind(), error = %e, "daily credit claim failed");
            Ok(credit.total())
        }
    }
}

fn apply_outcome(entry: &mut TokenEntry, outcome: ProbeOutcome, now: u64) {
    entry.last_checked_at = Some(now);
    match outcome {
        ProbeOutcome::MissingRegion => {
            entry.live = Some(false);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_error = Some("missing_region".to_string());
        }
        ProbeOutcome::NotLive => {
            entry.live = Some(false);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_error = Some("token rejected by upstream".to_string());
        }
        ProbeOutcome::Failed(error) => {
            entry.live = Some(false);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_error = Some(error);
        }
        ProbeOutcome::Live {
            credit,
            capabilities,
        } => {
            entry.live = Some(true);
            entry.consecutive_failures = 0;
            entry.last_error = None;

            // Credit and capability failures are recorded but never flip liveness.
            match credit {
                Some(Ok(total)) => entry.last_credit = Some(total),
                Some(Err(e)) => entry.last_error = Some(format!("credit check failed: {e}")),
                None => {}
            }
            match capabilities {
                Some(Ok(snapshot)) => {
                    entry.dynamic_capabilities =
                        Some(DynamicCapabilities::from_snapshot(snapshot, now));
                }
                Some(Err(e)) => {
                    let message = format!("capability refresh failed: {e}");
                    entry.last_error = Some(match entry.last_error.take() {
                        Some(credit_error) => format!("{credit_error}; {message}"),
                        None => message,
                    });
                }
                None => {}
            }
        }
    }
}

/// Disable every enabled entry at or past the failure threshold.
///
/// Returns the tokens that were disabled.
fn auto_disable(entries: &mut [TokenEntry], threshold: u32) -> Vec<String> {
    let mut disabled = Vec::new();
    for entry in entries.iter_mut() {
        if entry.enabled && entry.consecutive_failures >= threshold {
            entry.enabled = false;
            entry.live = Some(false);
            disabled.push(entry.token.clone());
        }
    }
    disabled
}
