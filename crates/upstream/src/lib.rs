//! Upstream collaborator abstraction
//!
//! Defines the `Upstream` trait the token pool uses to probe credentials:
//! liveness, credit balance, daily credit claim, and dynamic capability
//! discovery. The pool never talks HTTP directly; `HttpUpstream` is the
//! production implementation and tests substitute scripted fakes.

pub mod error;
pub mod http;

pub use error::{Error, Result};
pub use http::{HttpUpstream, RequestOptions, UpstreamEndpoints};

use common::RegionCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Credit balance reported by the upstream for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credit {
    #[serde(default)]
    pub gift_credit: i64,
    #[serde(default)]
    pub purchase_credit: i64,
    #[serde(default)]
    pub vip_credit: i64,
}

impl Credit {
    pub fn total(&self) -> i64 {
        self.gift_credit
            .saturating_add(self.purchase_credit)
            .saturating_add(self.vip_credit)
    }
}

/// Model and feature lists discovered from the upstream configuration
/// endpoints for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySnapshot {
    #[serde(default)]
    pub image_models: Option<Vec<String>>,
    #[serde(default)]
    pub video_models: Option<Vec<String>>,
    #[serde(default)]
    pub capability_tags: Option<Vec<String>>,
}

/// Abstraction over the signed upstream API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Whether the session is still accepted by the upstream.
    ///
    /// `Ok(false)` means the upstream answered and rejected the session;
    /// `Err` means the question could not be answered.
    fn token_live_status<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Current credit balance.
    fn credit<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<Credit>> + Send + 'a>>;

    /// Claim the daily credit grant, returning the balance afterwards.
    fn receive_credit<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<Credit>> + Send + 'a>>;

    /// Probe the models and capability tags available to the session.
    fn capabilities<'a>(
        &'a self,
        token: &'a str,
        region: RegionCode,
    ) -> Pin<Box<dyn Future<Output = Result<CapabilitySnapshot>> + Send + 'a>>;
}
