//! Error types for upstream calls

use common::RegionCode;

/// Errors from upstream operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// 401/403: the upstream rejected the session itself.
    #[error("session rejected by upstream ({status})")]
    Unauthorized { status: u16 },

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("no upstream base URL configured for region {0}")]
    RegionNotConfigured(RegionCode),
}

impl Error {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Unauthorized { .. } => "unauthorized",
            Error::Status { .. } => "status",
            Error::Decode(_) => "decode",
            Error::RegionNotConfigured(_) => "region_not_configured",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, Error>;
