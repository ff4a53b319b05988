use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mailbridge_net::{IntentError, RemoteError};
use mailbridge_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::converter::ConversionError;

/// Failure of a single bridged message or bridge operation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Message is too old ({age_ms} ms) to be handled")]
    TimeoutBeforeHandling { age_ms: i64 },

    #[error("Handling the message took too long")]
    DeadlineExceeded,

    #[error("Ignoring message, sender is not logged in and no relay is available")]
    NotLoggedIn,

    #[error("Notices are not bridged")]
    NoticesDisabled,

    #[error("Edit target not found")]
    EditTargetNotFound,

    #[error("Cannot edit a message sent by someone else")]
    EditNotOwner,

    #[error("Sender is not allowed to use this portal")]
    Forbidden,

    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Chat transport error: {0}")]
    Intent(#[from] IntentError),

    #[error("Mail transport error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure class used for status reporting and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Conversion,
    Timeout,
    Declined,
    Persistence,
    Transport,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Conversion => "conversion",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Declined => "declined",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::Transport => "transport",
        }
    }
}

impl BridgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Conversion(_) => ErrorCategory::Conversion,
            BridgeError::TimeoutBeforeHandling { .. } | BridgeError::DeadlineExceeded => {
                ErrorCategory::Timeout
            }
            BridgeError::NotLoggedIn
            | BridgeError::NoticesDisabled
            | BridgeError::EditTargetNotFound
            | BridgeError::EditNotOwner
            | BridgeError::Forbidden => ErrorCategory::Declined,
            BridgeError::Store(_) | BridgeError::Internal(_) => ErrorCategory::Persistence,
            BridgeError::Intent(_) | BridgeError::Remote(_) => ErrorCategory::Transport,
        }
    }
}

/// Errors returned by the HTTP API, rendered in the homeserver's error shape.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Invalid access token")]
    InvalidToken,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, errcode) = match &self {
            ApiError::MissingToken => (StatusCode::UNAUTHORIZED, "M_MISSING_TOKEN"),
            ApiError::InvalidToken => (StatusCode::FORBIDDEN, "M_FORBIDDEN"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "M_BAD_JSON"),
        };

        let body = serde_json::json!({
            "errcode": errcode,
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
