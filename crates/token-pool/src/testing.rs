//! Scripted upstream and manager helpers for unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::RegionCode;
use upstream::{CapabilitySnapshot, Credit, Upstream};

use crate::config::PoolConfig;
use crate::manager::PoolManager;

#[derive(Debug, Clone, Copy)]
pub enum FakeLiveness {
    Live,
    Dead,
    Error,
}

/// In-memory upstream. Tokens are live unless scripted otherwise; capability
/// probes fail until a snapshot is set.
pub struct FakeUpstream {
    liveness: Mutex<HashMap<String, FakeLiveness>>,
    credit: AtomicI64,
    credit_fails: AtomicBool,
    capabilities: Mutex<Option<CapabilitySnapshot>>,
    delay: Option<Duration>,
    live_calls: AtomicUsize,
    receive_calls: AtomicUsize,
    capability_calls: AtomicUsize,
}

impl FakeUpstream {
    pub const DEFAULT_CREDIT: i64 = 100;
    pub const CLAIMED_CREDIT: i64 = 60;

    pub fn new() -> Self {
        Self {
            liveness: Mutex::new(HashMap::new()),
            credit: AtomicI64::new(Self::DEFAULT_CREDIT),
            credit_fails: AtomicBool::new(false),
            capabilities: Mutex::new(None),
            delay: None,
            live_calls: AtomicUsize::new(0),
            receive_calls: AtomicUsize::new(0),
            capability_calls: AtomicUsize::new(0),
        }
    }

    /// Make every liveness call sleep first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_liveness(&self, token: &str, liveness: FakeLiveness) {
        self.liveness
            .lock()
            .unwrap()
            .insert(token.to_string(), liveness);
    }

    pub fn set_credit(&self, total: i64) {
        self.credit.store(total, Ordering::SeqCst);
    }

    pub fn fail_credit(&self) {
        self.credit_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_capabilities(&self, snapshot: CapabilitySnapshot) {
        *self.capabilities.lock().unwrap() = Some(snapshot);
    }

    pub fn live_calls(&self) -> usize {
        self.live_calls.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn capability_calls(&self) -> usize {
        self.capability_calls.load(Ordering::SeqCst)
    }

    fn unavailable() -> upstream::Error {
        upstream::Error::Status {
            status: 503,
            body: "service unavailable".into(),
        }
    }
}

impl Upstream for FakeUpstream {
    fn id(&self) -> &str {
        "fake"
    }

    fn token_live_status<'a>(
        &'a self,
        token: &'a str,
        _region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.live_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.liveness.lock().unwrap().get(token).copied();
            match scripted.unwrap_or(FakeLiveness::Live) {
                FakeLiveness::Live => Ok(true),
                FakeLiveness::Dead => Ok(false),
                FakeLiveness::Error => Err(Self::unavailable()),
            }
        })
    }

    fn credit<'a>(
        &'a self,
        _token: &'a str,
        _region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<Credit>> + Send + 'a>> {
        Box::pin(async move {
            if self.credit_fails.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            Ok(Credit {
                gift_credit: self.credit.load(Ordering::SeqCst),
                ..Credit::default()
            })
        })
    }

    fn receive_credit<'a>(
        &'a self,
        _token: &'a str,
        _region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<Credit>> + Send + 'a>> {
        Box::pin(async move {
            self.receive_calls.fetch_add(1, Ordering::SeqCst);
            self.credit.store(Self::CLAIMED_CREDIT, Ordering::SeqCst);
            Ok(Credit {
                gift_credit: Self::CLAIMED_CREDIT,
                ..Credit::default()
            })
        })
    }

    fn capabilities<'a>(
        &'a self,
        _token: &'a str,
        _region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<CapabilitySnapshot>> + Send + 'a>> {
        Box::pin(async move {
            self.capability_calls.fetch_add(1, Ordering::SeqCst);
            self.capabilities
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| upstream::Error::Decode("no capability data".into()))
        })
    }
}

/// Enabled manager writing `token-pool.json` under `dir`, loop off unless
/// `configure` turns it on.
pub fn test_manager(
    dir: &Path,
    upstream: Arc<FakeUpstream>,
    configure: impl FnOnce(&mut PoolConfig),
) -> Arc<PoolManager> {
    let mut config = PoolConfig {
        file_path: dir.join("token-pool.json"),
        health_check_interval: None,
        ..PoolConfig::default()
    };
    configure(&mut config);
    Arc::new(PoolManager::new(config, upstream))
}
