//! Admin API error responses

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use token_pool::{PickError, PickRejection};

/// Errors returned by admin handlers, rendered as `{ "error": ..., ... }`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("missing or invalid x-admin-key header")]
    Unauthorized,

    #[error(transparent)]
    Pool(#[from] token_pool::Error),

    /// Rendered with its own `{ error, region, reason }` shape.
    #[error(transparent)]
    Rejected(#[from] PickRejection),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Pool(err) => match err {
                token_pool::Error::PoolDisabled => StatusCode::CONFLICT,
                token_pool::Error::PrefixedToken(_) => StatusCode::BAD_REQUEST,
                token_pool::Error::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
                token_pool::Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            },
            ApiError::Rejected(rejection) => match rejection.error {
                PickError::InvalidAuthorizationFormat | PickError::EmptyAuthorizationTokens => {
                    StatusCode::UNAUTHORIZED
                }
                PickError::UnsupportedRegion | PickError::PrefixedTokenNotSupported => {
                    StatusCode::BAD_REQUEST
                }
                PickError::MissingRegion | PickError::NoMatchingToken => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Rejected(rejection) => json_response(status, rejection),
            other => json_response(status, &serde_json::json!({ "error": other.to_string() })),
        }
    }
}

/// Serialize `body` as a JSON response.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_string(body) {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": format!("failed to encode response: {e}") }).to_string(),
        )
            .into_response(),
    }
}
