//! Request-scoped token selection
//!
//! Pure decision logic over a snapshot of pool entries. Given the caller's
//! authorization header, region header, model and capability requirements,
//! `select` either picks a `(token, region)` pair or returns a typed
//! rejection. Checks run in a fixed order and stop at the first failure:
//!
//! 1. region header parses (`unsupported_region`)
//! 2. authorization header parses (`invalid_authorization_format`,
//!    `empty_authorization_tokens`)
//! 3. candidates: supplied tokens (pool entry if known, ad-hoc otherwise) or
//!    the whole pool (`no_matching_token` when empty)
//! 4. any legacy region-prefixed candidate stops routing
//!    (`prefixed_token_not_supported`)
//! 5. candidates with a usable region (`missing_region`)
//! 6. enabled, live and capable candidates (`no_matching_token`)
//! 7. strategy picks one

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{RegionCode, has_region_prefix, mask_token};
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::entry::{DynamicCapabilities, TaskType, TokenEntry};

/// How one token is chosen among equally eligible matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Random,
    /// One process-wide cursor shared by every call, whatever candidate list
    /// that call computed. Rotation is exact only while the list is stable.
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Random => "random",
            SelectionStrategy::RoundRobin => "round_robin",
        }
    }

    /// Index into a non-empty list of `len` matches.
    pub fn choose(&self, len: usize, cursor: &AtomicUsize) -> usize {
        debug_assert!(len > 0);
        match self {
            SelectionStrategy::Random => rand::rng().random_range(0..len),
            SelectionStrategy::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % len,
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SelectionStrategy::Random),
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(format!(
                "unknown selection strategy {other:?} (expected random or round_robin)"
            )),
        }
    }
}

/// Why a request could not be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PickError {
    InvalidAuthorizationFormat,
    EmptyAuthorizationTokens,
    UnsupportedRegion,
    PrefixedTokenNotSupported,
    MissingRegion,
    NoMatchingToken,
}

impl PickError {
    /// Stable code handed to route handlers.
    pub fn code(&self) -> &'static str {
        match self {
            PickError::InvalidAuthorizationFormat => "invalid_authorization_format",
            PickError::EmptyAuthorizationTokens => "empty_authorization_tokens",
            PickError::UnsupportedRegion => "unsupported_region",
            PickError::PrefixedTokenNotSupported => "prefixed_token_not_supported",
            PickError::MissingRegion => "missing_region",
            PickError::NoMatchingToken => "no_matching_token",
        }
    }
}

impl fmt::Display for PickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A rejected pick. `region` is a hint: the region the caller asked for, or
/// for `no_matching_token` the region a capable token would have served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{error}: {reason}")]
pub struct PickRejection {
    pub error: PickError,
    pub region: Option<RegionCode>,
    pub reason: String,
}

impl PickRejection {
    pub(crate) fn new(
        error: PickError,
        region: Option<RegionCode>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error,
            region,
            reason: reason.into(),
        }
    }
}

/// Routing context of one inbound request.
#[derive(Debug, Clone)]
pub struct PickRequest {
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    /// `None` skips model matching.
    pub requested_model: Option<String>,
    pub task_type: TaskType,
    pub required_capability_tags: Vec<String>,
    /// Raw `X-Region` header value.
    pub x_region: Option<String>,
}

impl PickRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            authorization: None,
            requested_model: None,
            task_type,
            required_capability_tags: Vec::new(),
            x_region: None,
        }
    }
}

/// The routed credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickedToken {
    pub token: String,
    pub region: RegionCode,
}

/// Read-only view of one token for the duration of a single pick.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub token: &'a str,
    pub region: Option<RegionCode>,
    pub enabled: bool,
    pub live: bool,
    pub allowed_models: &'a [String],
    pub capability_tags: &'a [String],
    pub dynamic: Option<&'a DynamicCapabilities>,
}

impl<'a> Candidate<'a> {
    pub fn from_entry(entry: &'a TokenEntry) -> Self {
        Self {
            token: &entry.token,
            region: entry.region,
            enabled: entry.enabled,
            live: entry.is_live(),
            allowed_models: entry.allowed_models.as_deref().unwrap_or(&[]),
            capability_tags: entry.capability_tags.as_deref().unwrap_or(&[]),
            dynamic: entry.dynamic_capabilities.as_ref(),
        }
    }

    /// A caller-supplied token unknown to the pool. Assumed enabled and live,
    /// serving whatever region the request named.
    pub fn ad_hoc(token: &'a str, region: Option<RegionCode>) -> Self {
        Self {
            token,
            region,
            enabled: true,
            live: true,
            allowed_models: &[],
            capability_tags: &[],
            dynamic: None,
        }
    }

    pub fn is_legacy_prefixed(&self) -> bool {
        has_region_prefix(self.token)
    }

    /// Model and capability-tag matching.
    ///
    /// A non-empty static allow-list is authoritative. Otherwise a non-empty
    /// discovered model list for the task type must contain the model; with
    /// no discovered list the token is not excluded. Every required tag must
    /// appear in the static or discovered tags.
    pub fn matches(
        &self,
        requested_model: Option<&str>,
        task_type: TaskType,
        required_tags: &[String],
    ) -> bool {
        if let Some(model) = requested_model {
            let allowed = if !self.allowed_models.is_empty() {
                self.allowed_models.iter().any(|m| m == model)
            } else {
                match self
                    .dynamic
                    .and_then(|caps| caps.models_for(task_type))
                    .filter(|models| !models.is_empty())
                {
                    Some(models) => models.iter().any(|m| m == model),
                    None => true,
                }
            };
            if !allowed {
                return false;
            }
        }

        let dynamic_tags = self
            .dynamic
            .and_then(|caps| caps.capability_tags.as_deref())
            .unwrap_or(&[]);
        required_tags
            .iter()
            .all(|tag| self.capability_tags.contains(tag) || dynamic_tags.contains(tag))
    }
}

/// Split a `Bearer <token>[,<token>...]` header.
///
/// `Ok(None)` when the header is absent or blank (select from the pool).
/// Tokens are trimmed and de-duplicated in order.
pub fn parse_authorization(header: Option<&str>) -> Result<Option<Vec<String>>, PickError> {
    let Some(raw) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };

    let (scheme, rest) = raw.split_once(char::is_whitespace).unwrap_or((raw, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(PickError::InvalidAuthorizationFormat);
    }

    let mut tokens: Vec<String> = Vec::new();
    for token in rest.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    if tokens.is_empty() {
        return Err(PickError::EmptyAuthorizationTokens);
    }
    Ok(Some(tokens))
}

fn authorization_rejection(error: PickError, region: Option<RegionCode>) -> PickRejection {
    let reason = match error {
        PickError::EmptyAuthorizationTokens => "authorization header contains no tokens",
        _ => "authorization header must be `Bearer <token>[,<token>...]`",
    };
    PickRejection::new(error, region, reason)
}

fn prefixed_rejection(token: &str, region: Option<RegionCode>) -> PickRejection {
    PickRejection::new(
        PickError::PrefixedTokenNotSupported,
        region,
        format!(
            "token {} uses the retired region-prefixed format; send the bare token with an X-Region header",
            mask_token(token)
        ),
    )
}

/// Route one request against a pool snapshot.
pub fn select(
    entries: &[TokenEntry],
    request: &PickRequest,
    strategy: SelectionStrategy,
    cursor: &AtomicUsize,
) -> Result<PickedToken, PickRejection> {
    let header_region = match request
        .x_region
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        None => None,
        Some(raw) => match RegionCode::parse(raw) {
            Some(region) => Some(region),
            None => {
                return Err(PickRejection::new(
                    PickError::UnsupportedRegion,
                    None,
                    format!("unsupported region {raw:?}, expected one of cn, us, hk, jp, sg"),
                ));
            }
        },
    };

    let supplied = parse_authorization(request.authorization.as_deref())
        .map_err(|error| authorization_rejection(error, header_region))?;

    let candidates: Vec<Candidate<'_>> = match &supplied {
        Some(tokens) => tokens
            .iter()
            .map(|token| match entries.iter().find(|e| &e.token == token) {
                Some(entry) => Candidate::from_entry(entry),
                None => Candidate::ad_hoc(token, header_region),
            })
            .collect(),
        None => entries.iter().map(Candidate::from_entry).collect(),
    };

    if candidates.is_empty() {
        return Err(PickRejection::new(
            PickError::NoMatchingToken,
            header_region,
            "no tokens available",
        ));
    }

    if let Some(legacy) = candidates.iter().find(|c| c.is_legacy_prefixed()) {
        return Err(prefixed_rejection(legacy.token, header_region));
    }

    let region_ready: Vec<(&Candidate<'_>, RegionCode)> = candidates
        .iter()
        .filter_map(|c| {
            c.region
                .filter(|region| header_region.is_none_or(|wanted| wanted == *region))
                .map(|region| (c, region))
        })
        .collect();

    if region_ready.is_empty() {
        let reason = match header_region {
            Some(region) => format!("no token is assigned to region {region}"),
            None => "no token has an assigned region".to_string(),
        };
        return Err(PickRejection::new(
            PickError::MissingRegion,
            header_region,
            reason,
        ));
    }

    let model = request.requested_model.as_deref();
    let matched: Vec<(&Candidate<'_>, RegionCode)> = region_ready
        .iter()
        .copied()
        .filter(|(c, _)| {
            c.enabled
                && c.live
                && c.matches(model, request.task_type, &request.required_capability_tags)
        })
        .collect();

    if matched.is_empty() {
        let hint = header_region.or(Some(region_ready[0].1));
        return Err(PickRejection::new(
            PickError::NoMatchingToken,
            hint,
            format!(
                "no enabled live token supports model {} with capabilities [{}]",
                model.unwrap_or("<any>"),
                request.required_capability_tags.join(", ")
            ),
        ));
    }

    let (chosen, region) = matched[strategy.choose(matched.len(), cursor)];
    Ok(PickedToken {
        token: chosen.token.to_string(),
        region,
    })
}

/// Ambient pick honouring a caller's `Authorization` header.
///
/// With no header this is `select_ambient`. Otherwise one of the supplied
/// tokens is chosen: pool-known tokens must be enabled and live, unknown ones
/// are used as-is with no region. `Ok(None)` when no supplied token is usable.
pub fn select_from_authorization(
    entries: &[TokenEntry],
    authorization: Option<&str>,
    strategy: SelectionStrategy,
    cursor: &AtomicUsize,
) -> Result<Option<(String, Option<RegionCode>)>, PickRejection> {
    let supplied = parse_authorization(authorization)
        .map_err(|error| authorization_rejection(error, None))?;
    let Some(tokens) = supplied else {
        return Ok(select_ambient(entries, strategy, cursor).map(|e| (e.token.clone(), e.region)));
    };

    if let Some(legacy) = tokens.iter().find(|t| has_region_prefix(t)) {
        return Err(prefixed_rejection(legacy, None));
    }

    let usable: Vec<Candidate<'_>> = tokens
        .iter()
        .map(|token| match entries.iter().find(|e| &e.token == token) {
            Some(entry) => Candidate::from_entry(entry),
            None => Candidate::ad_hoc(token, None),
        })
        .filter(|c| c.enabled && c.live)
        .collect();
    if usable.is_empty() {
        return Ok(None);
    }
    let chosen = &usable[strategy.choose(usable.len(), cursor)];
    Ok(Some((chosen.token.to_string(), chosen.region)))
}

/// Pick among enabled, live entries with no routing constraints.
pub fn select_ambient<'a>(
    entries: &'a [TokenEntry],
    strategy: SelectionStrategy,
    cursor: &AtomicUsize,
) -> Option<&'a TokenEntry> {
    let usable: Vec<&TokenEntry> = entries
        .iter()
        .filter(|e| e.enabled && e.is_live())
        .collect();
    if usable.is_empty() {
        return None;
    }
    Some(usable[strategy.choose(usable.len(), cursor)])
}
