//! Error taxonomy for the session runtime.
//!
//! Every failure that crosses a component boundary is an
//! [`ApplicationError`]: a stable machine-readable code, a human message,
//! a structured context payload, and a timestamp. The [`ErrorKind`]
//! carried inside is the single source of truth for retry decisions —
//! the retry executor and the conflict-handling branches both consult
//! [`ErrorKind::is_retryable`] rather than re-deriving policy locally.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::values::{Value, ValueMap};

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Closed set of failure classes, each with a fixed HTTP-status affinity
/// and a fixed retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request parameters failed validation (400).
    Validation,
    /// Credentials missing or expired (401); requires re-auth, never retry.
    Unauthorized,
    /// Resource does not exist (404).
    NotFound,
    /// A resource with the same identity already exists (409). Not
    /// retryable, but triggers the load-existing recovery path.
    SessionConflict,
    /// Payload was well-formed but semantically unusable (422).
    DataQuality,
    /// Backend throttled the caller (429).
    RateLimit,
    /// Backend-side computation failed (500).
    Calculation,
    /// An upstream dependency of the backend failed (502).
    Integration,
    /// Backend persistence layer unavailable (503).
    Database,
    /// The backend did not answer in time (504).
    Timeout,
    /// The request never produced an HTTP response.
    Network,
    /// Fallback for statuses outside the mapped set.
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::SessionConflict => "SESSION_CONFLICT",
            ErrorKind::DataQuality => "DATA_QUALITY_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT_EXCEEDED",
            ErrorKind::Calculation => "CALCULATION_ERROR",
            ErrorKind::Integration => "INTEGRATION_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// HTTP status this kind maps from, if any.
    pub fn http_status(self) -> Option<u16> {
        match self {
            ErrorKind::Validation => Some(400),
            ErrorKind::Unauthorized => Some(401),
            ErrorKind::NotFound => Some(404),
            ErrorKind::SessionConflict => Some(409),
            ErrorKind::DataQuality => Some(422),
            ErrorKind::RateLimit => Some(429),
            ErrorKind::Calculation => Some(500),
            ErrorKind::Integration => Some(502),
            ErrorKind::Database => Some(503),
            ErrorKind::Timeout => Some(504),
            ErrorKind::Network | ErrorKind::Unknown => None,
        }
    }

    /// Whether an automatic retry may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Integration
        )
    }

    /// Total status → kind mapping; unmapped statuses fall back to `Unknown`.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::Validation,
            401 => ErrorKind::Unauthorized,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::SessionConflict,
            422 => ErrorKind::DataQuality,
            429 => ErrorKind::RateLimit,
            500 => ErrorKind::Calculation,
            502 => ErrorKind::Integration,
            503 => ErrorKind::Database,
            504 => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Typed failure carried across every boundary of the session runtime.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.code())]
pub struct ApplicationError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured diagnostic payload, serialized alongside logs.
    pub context: ValueMap,
    pub timestamp: DateTime<Utc>,
    /// Server-suggested wait before retrying (from `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ApplicationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ValueMap::new(),
            timestamp: Utc::now(),
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn integration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integration, message)
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Map an HTTP response status to a typed error. Deterministic and total;
/// the originating status is preserved in the context payload.
pub fn classify_status(status: u16, message: impl Into<String>) -> ApplicationError {
    ApplicationError::new(ErrorKind::from_status(status), message)
        .with_context("httpStatus", status)
}
