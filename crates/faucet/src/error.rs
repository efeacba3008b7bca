//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::time::Duration;
use thiserror::Error;

use crate::service::FaucetResponse;

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(
        "You have requested {count} times. The limit is {limit} per {}. Try again in {}.",
        hms(.window_secs),
        hms(.retry_after_secs)
    )]
    RateLimitExceeded {
        count: u32,
        limit: u32,
        window_secs: u64,
        retry_after_secs: u64,
    },

    #[error("Faucet is busy, please try again shortly")]
    Busy,

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transaction rejected by chain: {0}")]
    ChainRejection(String),

    #[error("Broadcast timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FaucetError {
    /// Errors that may succeed when retried without any change on the caller's side.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FaucetError::Database(_)
                | FaucetError::Network(_)
                | FaucetError::Timeout(_)
                | FaucetError::Busy
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            FaucetError::InvalidAddress(_) | FaucetError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            FaucetError::RateLimitExceeded { .. } | FaucetError::Busy => {
                StatusCode::TOO_MANY_REQUESTS
            }
            FaucetError::Network(_) | FaucetError::ChainRejection(_) => StatusCode::BAD_GATEWAY,
            FaucetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FaucetError::Database(_)
            | FaucetError::Serialization(_)
            | FaucetError::KeyDerivation(_)
            | FaucetError::Config(_)
            | FaucetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for FaucetError {
    fn from(err: bincode::Error) -> Self {
        FaucetError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FaucetError {
    fn from(err: tokio::task::JoinError) -> Self {
        FaucetError::Internal(format!("Storage task failed: {}", err))
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Storage internals are not the client's business.
            FaucetError::Database(_) | FaucetError::Serialization(_) => {
                "Temporary storage failure, please retry".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(FaucetResponse::error(message))).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

/// Renders a number of seconds as e.g. `1 hour, 5 minutes, 3 seconds`.
pub fn format_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = total_secs % 3600 / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(plural(minutes, "minute"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(plural(seconds, "second"));
    }
    parts.join(", ")
}

fn hms(secs: &u64) -> String {
    format_hms(*secs)
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{} {}", n, unit)
    } else {
        format!("{} {}s", n, unit)
    }
}
