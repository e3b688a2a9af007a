//! Token entries and defensive record coercion
//!
//! `TokenEntry` is the persisted state of one credential. Records read from
//! disk are never trusted: every field goes through a coercion function that
//! returns `None` for anything malformed, and the entry falls back to safe
//! defaults instead of failing the whole load.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::RegionCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use upstream::CapabilitySnapshot;

/// How long probed capabilities stay fresh before the health checker
/// re-fetches them. Independent of the health-check interval.
pub const DYNAMIC_CAPABILITY_TTL: Duration = Duration::from_secs(30 * 60);

/// Kind of generation task a request is routed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Image,
    Video,
}

/// Capabilities discovered from the upstream for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_tags: Option<Vec<String>>,
    /// Unix timestamp in milliseconds
    pub updated_at: u64,
}

impl DynamicCapabilities {
    pub fn from_snapshot(snapshot: CapabilitySnapshot, now: u64) -> Self {
        Self {
            image_models: snapshot.image_models.map(clean_list),
            video_models: snapshot.video_models.map(clean_list),
            capability_tags: snapshot.capability_tags.map(clean_list),
            updated_at: now,
        }
    }

    /// Model list for the task type, if one was discovered.
    pub fn models_for(&self, task_type: TaskType) -> Option<&[String]> {
        match task_type {
            TaskType::Image => self.image_models.as_deref(),
            TaskType::Video => self.video_models.as_deref(),
        }
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.updated_at) >= DYNAMIC_CAPABILITY_TTL.as_millis() as u64
    }

    fn from_record(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        Some(Self {
            image_models: coerce_string_list(map.get("imageModels")),
            video_models: coerce_string_list(map.get("videoModels")),
            capability_tags: coerce_string_list(map.get("capabilityTags")),
            updated_at: coerce_u64(map.get("updatedAt")).unwrap_or(0),
        })
    }
}

/// One credential's full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEntry {
    pub token: String,
    /// `None` until assigned; such entries are never routed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionCode>,
    pub enabled: bool,
    /// `None` means never checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_credit: Option<i64>,
    /// Static allow-list. When non-empty, dynamic model data is ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_capabilities: Option<DynamicCapabilities>,
}

impl TokenEntry {
    /// A freshly added entry: enabled, never checked.
    pub fn new(token: String, region: Option<RegionCode>) -> Self {
        Self {
            token,
            region,
            enabled: true,
            live: None,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
            last_credit: None,
            allowed_models: None,
            capability_tags: None,
            dynamic_capabilities: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live == Some(true)
    }

    /// Whether the health checker should re-probe capabilities.
    pub fn capabilities_stale(&self, now: u64) -> bool {
        self.dynamic_capabilities
            .as_ref()
            .is_none_or(|caps| caps.is_stale(now))
    }

    /// Build an entry from an untrusted persisted record.
    ///
    /// Returns `None` only when the record has no usable token. Invalid
    /// regions become `None`, non-finite or negative numbers fall back to
    /// defaults, and non-array capability lists are dropped.
    pub fn from_record(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let token = coerce_string(map.get("token"))?;
        Some(Self {
            token,
            region: coerce_region(map.get("region")),
            enabled: coerce_bool(map.get("enabled")).unwrap_or(true),
            live: coerce_bool(map.get("live")),
            consecutive_failures: coerce_u64(map.get("consecutiveFailures"))
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(0),
            last_checked_at: coerce_u64(map.get("lastCheckedAt")),
            last_error: coerce_string(map.get("lastError")),
            last_credit: coerce_i64(map.get("lastCredit")),
            allowed_models: coerce_string_list(map.get("allowedModels")),
            capability_tags: coerce_string_list(map.get("capabilityTags")),
            dynamic_capabilities: map
                .get("dynamicCapabilities")
                .and_then(DynamicCapabilities::from_record),
        })
    }
}

/// Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn coerce_region(value: Option<&Value>) -> Option<RegionCode> {
    RegionCode::parse(value?.as_str()?)
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    value?.as_bool()
}

fn coerce_u64(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f.is_finite() && f >= 0.0).then_some(f as u64)
}

fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    f.is_finite().then_some(f as i64)
}

fn coerce_string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(clean_list(
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
    ))
}

/// Trim, drop empties, dedupe preserving order.
pub(crate) fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|existing| existing == item) {
            out.push(item.to_string());
        }
    }
    out
}
