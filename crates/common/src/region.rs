//! Upstream region codes
//!
//! The upstream is deployed in five zones. A session token is only valid
//! against the zone it was issued in, so every routed request carries both
//! a token and a region. Older tokens embedded the zone as a `xx-` prefix of
//! the token string itself; that format is rejected but still recognized so
//! callers get a specific error instead of a generic mismatch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secret::mask_token;

/// Supported upstream deployment zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionCode {
    Cn,
    Us,
    Hk,
    Jp,
    Sg,
}

impl RegionCode {
    pub const ALL: [RegionCode; 5] = [
        RegionCode::Cn,
        RegionCode::Us,
        RegionCode::Hk,
        RegionCode::Jp,
        RegionCode::Sg,
    ];

    /// Parse a region code. Exact, case-sensitive match on the five codes.
    pub fn parse(input: &str) -> Option<RegionCode> {
        Self::ALL.into_iter().find(|region| region.as_str() == input)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegionCode::Cn => "cn",
            RegionCode::Us => "us",
            RegionCode::Hk => "hk",
            RegionCode::Jp => "jp",
            RegionCode::Sg => "sg",
        }
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the token uses the legacy `cn-|us-|hk-|jp-|sg-` prefix (any case).
pub fn has_region_prefix(token: &str) -> bool {
    let Some(prefix) = token.get(..3) else {
        return false;
    };
    if !prefix.ends_with('-') {
        return false;
    }
    let code = prefix[..2].to_ascii_lowercase();
    RegionCode::parse(&code).is_some()
}

/// Reject tokens in the legacy region-prefixed format.
pub fn assert_token_without_region_prefix(token: &str) -> Result<()> {
    if has_region_prefix(token) {
        return Err(Error::PrefixedToken(mask_token(token)));
    }
    Ok(())
}
