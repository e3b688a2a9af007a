//! Pool behaviour settings

use std::path::PathBuf;
use std::time::Duration;

use crate::selector::SelectionStrategy;

/// Default location of the persisted pool.
pub const DEFAULT_POOL_FILE: &str = "configs/token-pool.json";

/// Default health-check cadence (10 minutes).
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// Settings for `PoolManager`. The service binary builds this from its
/// TOML file and environment overlay.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Master switch. A disabled pool loads nothing, runs no health checks
    /// and rejects mutations; routing then only uses caller-supplied tokens.
    pub enabled: bool,
    pub file_path: PathBuf,
    /// `None` disables the background loop.
    pub health_check_interval: Option<Duration>,
    pub fetch_credit_on_check: bool,
    /// Claim the daily credit grant when a check finds a zero balance.
    pub claim_credit_when_empty: bool,
    pub auto_disable: bool,
    pub auto_disable_failures: u32,
    pub strategy: SelectionStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: PathBuf::from(DEFAULT_POOL_FILE),
            health_check_interval: Some(DEFAULT_HEALTH_CHECK_INTERVAL),
            fetch_credit_on_check: true,
            claim_credit_when_empty: false,
            auto_disable: true,
            auto_disable_failures: 2,
            strategy: SelectionStrategy::Random,
        }
    }
}

impl PoolConfig {
    /// Interval from a millisecond setting where `<= 0` means disabled.
    pub fn interval_from_millis(ms: i64) -> Option<Duration> {
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Failure threshold for auto-disable, never below 1.
    pub fn failure_threshold(&self) -> u32 {
        self.auto_disable_failures.max(1)
    }
}
