// Error taxonomy shared by every layer that talks to the upstream service

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitSnapshot;

// Closed set of upstream failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureKind {
    RateLimit,
    ApiUnavailable,
    NetworkError,
    ParseError,
    ValidationError,
    // Rejected locally because the breaker for the operation is open
    ServiceUnavailable,
    Unknown,
}

impl FailureKind {
    pub const ALL: [FailureKind; 7] = [
        FailureKind::RateLimit,
        FailureKind::ApiUnavailable,
        FailureKind::NetworkError,
        FailureKind::ParseError,
        FailureKind::ValidationError,
        FailureKind::ServiceUnavailable,
        FailureKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => "RATE_LIMIT",
            FailureKind::ApiUnavailable => "API_UNAVAILABLE",
            FailureKind::NetworkError => "NETWORK_ERROR",
            FailureKind::ParseError => "PARSE_ERROR",
            FailureKind::ValidationError => "VALIDATION_ERROR",
            FailureKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            FailureKind::Unknown => "UNKNOWN",
        }
    }

    // Default text shown to end users for this kind
    pub fn default_user_message(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => {
                "BoardGameGeek is receiving too many requests right now. Please try again in a moment."
            }
            FailureKind::ApiUnavailable => {
                "BoardGameGeek is temporarily unavailable. Please try again later."
            }
            FailureKind::NetworkError => {
                "We could not reach BoardGameGeek. Check your connection and try again."
            }
            FailureKind::ParseError => "BoardGameGeek returned data we could not read.",
            FailureKind::ValidationError => "The request is not valid.",
            FailureKind::ServiceUnavailable => {
                "Game lookups are paused while BoardGameGeek recovers. Please try again shortly."
            }
            FailureKind::Unknown => "Something went wrong while talking to BoardGameGeek.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: FailureKind,
    // Technical message, for logs
    pub message: String,
    user_message: Option<String>,
    pub retry_after: Option<Duration>,
    pub status: Option<u16>,
    pub circuit: Option<CircuitSnapshot>,
}

impl ApiError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            user_message: None,
            retry_after: None,
            status: None,
            circuit: None,
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimit, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ApiUnavailable, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NetworkError, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseError, message)
    }

    pub fn validation(message: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self::new(FailureKind::ValidationError, message).with_user_message(user_message)
    }

    pub fn circuit_open(operation: &str, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(
            FailureKind::ServiceUnavailable,
            format!("circuit open for {operation}"),
        );
        err.retry_after = retry_after;
        err
    }

    // A user message equal to the technical message is dropped so the
    // default text for the kind is shown instead
    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        let user_message = user_message.into();
        if user_message != self.message {
            self.user_message = Some(user_message);
        }
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_circuit(mut self, snapshot: CircuitSnapshot) -> Self {
        self.circuit = Some(snapshot);
        self
    }

    pub fn user_message(&self) -> &str {
        self.user_message
            .as_deref()
            .unwrap_or_else(|| self.kind.default_user_message())
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::RateLimit
    }

    // Upstream accepted the request but is still preparing the answer (HTTP 202)
    pub fn is_queued(&self) -> bool {
        self.kind == FailureKind::RateLimit && self.status == Some(202)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field} of {value} exceeds the safe limit of {limit}")]
    AboveLimit {
        field: &'static str,
        value: f64,
        limit: f64,
    },

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::validation(
            format!("invalid configuration: {err}"),
            "The game service is misconfigured.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_never_equals_technical_message() {
        let err = ApiError::rate_limit("empty body").with_user_message("empty body");
        assert_ne!(err.user_message(), err.message);
        assert_eq!(err.user_message(), FailureKind::RateLimit.default_user_message());

        let err = ApiError::validation("query too short: 1 chars", "Please enter at least 2 characters.");
        assert_eq!(err.user_message(), "Please enter at least 2 characters.");
    }

    #[test]
    fn only_rate_limits_are_retryable() {
        assert!(ApiError::rate_limit("x").is_retryable());
        for kind in FailureKind::ALL {
            if kind != FailureKind::RateLimit {
                assert!(!ApiError::new(kind, "x").is_retryable());
            }
        }
    }

    #[test]
    fn display_includes_kind() {
        let err = ApiError::circuit_open("search", None);
        assert_eq!(err.to_string(), "SERVICE_UNAVAILABLE: circuit open for search");
    }
}
