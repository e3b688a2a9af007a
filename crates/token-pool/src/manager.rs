//! Pool composition root
//!
//! `PoolManager` wires the store, the selector and the health checker behind
//! the operations route handlers use. It owns the round-robin cursor and the
//! health-check guard. Construct one per process, call `init` once the
//! runtime is up, and share it as `Arc<PoolManager>`.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use common::{RegionCode, assert_token_without_region_prefix, mask_token};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use upstream::Upstream;

use crate::config::PoolConfig;
use crate::entry::{TokenEntry, clean_list, now_millis};
use crate::error::{Error, Result};
use crate::health::{self, HealthCheckReport};
use crate::metrics;
use crate::selector::{self, PickRejection, PickRequest, PickedToken, SelectionStrategy};
use crate::store::{self, PoolCounts, PoolStore};

/// A token to add, as supplied by an operator.
///
/// Deserializes from either a bare string or an object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NewToken {
    Bare(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        token: String,
        #[serde(default)]
        region: Option<RegionCode>,
        #[serde(default)]
        allowed_models: Option<Vec<String>>,
        #[serde(default)]
        capability_tags: Option<Vec<String>>,
    },
}

impl NewToken {
    fn token(&self) -> &str {
        match self {
            NewToken::Bare(token) | NewToken::Detailed { token, .. } => token.trim(),
        }
    }

    fn into_entry(self, default_region: Option<RegionCode>) -> TokenEntry {
        match self {
            NewToken::Bare(token) => TokenEntry::new(token.trim().to_string(), default_region),
            NewToken::Detailed {
                token,
                region,
                allowed_models,
                capability_tags,
            } => {
                let mut entry = TokenEntry::new(token.trim().to_string(), region.or(default_region));
                entry.allowed_models = allowed_models.map(clean_list);
                entry.capability_tags = capability_tags.map(clean_list);
                entry
            }
        }
    }
}

impl From<&str> for NewToken {
    fn from(token: &str) -> Self {
        NewToken::Bare(token.to_string())
    }
}

impl From<String> for NewToken {
    fn from(token: String) -> Self {
        NewToken::Bare(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTokensReport {
    pub added: usize,
    /// Blank or already present.
    pub skipped: usize,
    pub total: usize,
}

/// Result of an ambient pick. `region` is `None` for unassigned entries and
/// for caller-supplied tokens unknown to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbientToken {
    pub token: String,
    pub region: Option<RegionCode>,
}

/// Pool state and configuration echo for observability endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub enabled: bool,
    pub file_path: String,
    pub strategy: SelectionStrategy,
    /// `None` when the background loop is off.
    pub health_check_interval_ms: Option<u64>,
    pub fetch_credit_on_check: bool,
    pub claim_credit_when_empty: bool,
    pub auto_disable: bool,
    pub auto_disable_failures: u32,
    #[serde(flatten)]
    pub counts: PoolCounts,
}

pub struct PoolManager {
    pub(crate) config: PoolConfig,
    pub(crate) upstream: Arc<dyn Upstream>,
    pub(crate) store: RwLock<PoolStore>,
    persist_lock: Mutex<()>,
    health_gate: Mutex<()>,
    next_index: AtomicUsize,
    initialized: OnceCell<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Create an empty, uninitialized manager.
    pub fn new(config: PoolConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            config,
            upstream,
            store: RwLock::new(PoolStore::new()),
            persist_lock: Mutex::new(()),
            health_gate: Mutex::new(()),
            next_index: AtomicUsize::new(0),
            initialized: OnceCell::new(),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Load the pool file and start the health-check loop.
    ///
    /// Idempotent: only the first call does anything, concurrent callers wait
    /// for it. A disabled pool loads nothing and starts no loop.
    pub async fn init(self: &Arc<Self>) {
        self.initialized
            .get_or_init(|| async {
                if !self.config.enabled {
                    info!("token pool disabled, routing only caller-supplied tokens");
                    return;
                }

                let loaded = PoolStore::load_from_disk(&self.config.file_path).await;
                *self.store.write().await = loaded;
                self.update_gauges().await;

                match self.config.health_check_interval {
                    Some(interval) => {
                        let handle = health::spawn_health_check_task(Arc::clone(self), interval);
                        *self.health_task.lock().await = Some(handle);
                        info!(interval_secs = interval.as_secs(), "token health check loop started");
                    }
                    None => info!("token health check loop disabled"),
                }
            })
            .await;
    }

    /// Stop the background loop. Pool state is left as is.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
            debug!("token health check loop stopped");
        }
    }

    pub async fn summary(&self) -> PoolSummary {
        let counts = self.store.read().await.counts();
        let config = &self.config;
        PoolSummary {
            enabled: config.enabled,
            file_path: config.file_path.display().to_string(),
            strategy: config.strategy,
            health_check_interval_ms: config
                .health_check_interval
                .map(|interval| interval.as_millis() as u64),
            fetch_credit_on_check: config.fetch_credit_on_check,
            claim_credit_when_empty: config.claim_credit_when_empty,
            auto_disable: config.auto_disable,
            auto_disable_failures: config.failure_threshold(),
            counts,
        }
    }

    /// Every entry in insertion order, tokens masked unless `mask` is false.
    pub async fn entries(&self, mask: bool) -> Vec<TokenEntry> {
        self.store.read().await.all(mask)
    }

    /// Add tokens, skipping ones already present.
    ///
    /// Every token is validated before any is inserted: one region-prefixed
    /// token rejects the whole batch. Existing entries are never overwritten.
    pub async fn add_tokens(
        &self,
        tokens: Vec<NewToken>,
        default_region: Option<RegionCode>,
    ) -> Result<AddTokensReport> {
        self.ensure_enabled()?;
        for token in &tokens {
            assert_token_without_region_prefix(token.token())?;
        }

        let mut added = 0;
        let mut skipped = 0;
        let total = {
            let mut store = self.store.write().await;
            for token in tokens {
                if token.token().is_empty() {
                    skipped += 1;
                    continue;
                }
                let entry = token.into_entry(default_region);
                let masked = mask_token(&entry.token);
                let region = entry.region;
                if store.insert_if_absent(entry) {
                    added += 1;
                    info!(token = %masked, region = ?region, "token added to pool");
                } else {
                    skipped += 1;
                    debug!(token = %masked, "token already in pool, keeping existing entry");
                }
            }
            store.len()
        };

        if added > 0 {
            self.update_gauges().await;
            self.persist().await?;
        }
        Ok(AddTokensReport {
            added,
            skipped,
            total,
        })
    }

    /// Remove tokens, returning how many were present.
    pub async fn remove_tokens(&self, tokens: &[String]) -> Result<usize> {
        self.ensure_enabled()?;
        let removed = {
            let mut store = self.store.write().await;
            tokens
                .iter()
                .filter(|token| store.delete(token.trim()).is_some())
                .inspect(|token| info!(token = %mask_token(token), "token removed from pool"))
                .count()
        };

        if removed > 0 {
            self.update_gauges().await;
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Enable or disable one token. Returns `false` when the token is unknown.
    ///
    /// Re-enabling clears the failure count so the entry is not disabled
    /// again by the next health-check pass.
    pub async fn set_token_enabled(&self, token: &str, enabled: bool) -> Result<bool> {
        self.ensure_enabled()?;
        {
            let mut store = self.store.write().await;
            let Some(entry) = store.get_mut(token.trim()) else {
                return Ok(false);
            };
            entry.enabled = enabled;
            if enabled {
                entry.consecutive_failures = 0;
            }
        }
        info!(token = %mask_token(token.trim()), enabled, "token enablement changed");

        self.update_gauges().await;
        self.persist().await?;
        Ok(true)
    }

    /// Route one request. Never blocks on upstream I/O.
    pub async fn pick_token_for_request(
        &self,
        request: &PickRequest,
    ) -> std::result::Result<PickedToken, PickRejection> {
        let result = {
            let store = self.store.read().await;
            selector::select(
                store.entries(),
                request,
                self.config.strategy,
                &self.next_index,
            )
        };

        match &result {
            Ok(picked) => {
                metrics::record_pick("ok");
                debug!(token = %mask_token(&picked.token), region = %picked.region, "token picked");
            }
            Err(rejection) => {
                metrics::record_pick(rejection.error.code());
                debug!(error = rejection.error.code(), reason = %rejection.reason, "token pick rejected");
            }
        }
        result
    }

    /// Ambient pick: any enabled, live entry regardless of region or model.
    pub async fn pick_token(&self) -> Option<AmbientToken> {
        let store = self.store.read().await;
        selector::select_ambient(store.entries(), self.config.strategy, &self.next_index).map(
            |entry| AmbientToken {
                token: entry.token.clone(),
                region: entry.region,
            },
        )
    }

    /// Ambient pick preferring the caller's own tokens when an
    /// `Authorization` header is present.
    pub async fn pick_token_from_authorization(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<Option<AmbientToken>, PickRejection> {
        let store = self.store.read().await;
        let picked = selector::select_from_authorization(
            store.entries(),
            authorization,
            self.config.strategy,
            &self.next_index,
        )?;
        Ok(picked.map(|(token, region)| AmbientToken { token, region }))
    }

    /// Write back the result of a manual check. Returns `false` when the
    /// token is not in the pool.
    ///
    /// A live result is treated as operator-confirmed recovery: the failure
    /// count is cleared and the entry is re-enabled even if it had been
    /// auto-disabled.
    pub async fn sync_token_check_result(&self, token: &str, live: bool) -> Result<bool> {
        let error = (!live).then(|| "manual check failed".to_string());
        self.record_manual_check(token, live, error).await
    }

    /// Check one token against the upstream now and write the result back.
    pub async fn check_token(&self, token: &str, region: RegionCode) -> Result<bool> {
        assert_token_without_region_prefix(token)?;
        match self.upstream.token_live_status(token, region).await {
            Ok(live) => {
                self.sync_token_check_result(token, live).await?;
                info!(token = %mask_token(token), %region, live, "manual token check");
                Ok(live)
            }
            Err(e) => {
                warn!(token = %mask_token(token), %region, error = %e, "manual token check failed");
                self.record_manual_check(token, false, Some(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn record_manual_check(
        &self,
        token: &str,
        live: bool,
        error: Option<String>,
    ) -> Result<bool> {
        {
            let mut store = self.store.write().await;
            let Some(entry) = store.get_mut(token.trim()) else {
                return Ok(false);
            };
            entry.live = Some(live);
            entry.last_checked_at = Some(now_millis());
            entry.last_error = error;
            if live {
                entry.consecutive_failures = 0;
                entry.enabled = true;
            } else {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            }
        }

        self.update_gauges().await;
        self.persist().await?;
        Ok(true)
    }

    /// Run one health-check pass now.
    ///
    /// Returns a skipped report when the pool is disabled or another pass is
    /// still running.
    pub async fn run_health_check(&self) -> Result<HealthCheckReport> {
        if !self.config.enabled {
            return Ok(HealthCheckReport::skipped());
        }
        let Ok(_running) = self.health_gate.try_lock() else {
            return Ok(HealthCheckReport::skipped());
        };
        health::run_pass(self).await
    }

    /// Replace in-memory state with the pool file. Returns the entry count.
    pub async fn reload_from_disk(&self) -> Result<usize> {
        self.ensure_enabled()?;
        let loaded = PoolStore::load_from_disk(&self.config.file_path).await;
        let count = loaded.len();
        *self.store.write().await = loaded;
        self.update_gauges().await;
        info!(tokens = count, path = %self.config.file_path.display(), "token pool reloaded");
        Ok(count)
    }

    /// Write the full pool to disk. No-op for a disabled pool.
    pub(crate) async fn persist(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        // Serialize writers so an older snapshot never lands after a newer one.
        let _writing = self.persist_lock.lock().await;
        let json = self.store.read().await.to_json(now_millis())?;
        store::persist(&self.config.file_path, json).await
    }

    pub(crate) async fn update_gauges(&self) {
        let counts = self.store.read().await.counts();
        metrics::set_pool_gauges(&counts);
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(Error::PoolDisabled)
        }
    }
}
