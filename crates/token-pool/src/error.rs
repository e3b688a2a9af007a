//! Error types for pool operations

/// Errors from pool mutations and health checks.
///
/// Request routing never produces these; see `selector::PickRejection`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token pool is disabled")]
    PoolDisabled,

    /// Carries the masked token.
    #[error("region-prefixed token format is no longer supported: {0}")]
    PrefixedToken(String),

    #[error("token pool persistence failed: {0}")]
    Persist(String),

    #[error("upstream check failed: {0}")]
    Upstream(#[from] upstream::Error),
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::PrefixedToken(masked) => Error::PrefixedToken(masked),
            other => Error::Persist(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
