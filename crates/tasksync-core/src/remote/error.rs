//! Remote error classification.
//!
//! Adapters classify every failure exactly once, at the boundary; everything
//! downstream branches on [`ErrorKind`] and never re-inspects messages.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure classes the sync engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or timeout; always transient
    Network,
    /// Credentials rejected; fatal to the session until they change
    Auth,
    /// Remote throttling; transient
    RateLimited,
    /// The remote record is gone
    NotFound,
    /// The remote service rejected the payload
    Validation,
    /// Anything else; treated as non-retryable unless it carries a 5xx status
    Unknown,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    /// HTTP status, when the failure came with a response
    pub status: Option<u16>,
    pub message: String,
    /// The request timed out (client side or gateway)
    pub timed_out: bool,
    /// Server-provided `Retry-After` hint
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            timed_out: false,
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// A request that ran out of time; classified as a network failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(ErrorKind::Network, message)
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Classify an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let mut error = match status {
            401 | 403 => Self::auth(message),
            404 | 410 => Self::not_found(message),
            408 | 504 => Self::timeout(message),
            429 => Self::rate_limited(message),
            400 | 409 | 422 => Self::validation(message),
            _ => Self::unknown(message),
        };
        error.status = Some(status);
        error
    }

    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Network, rate-limited and 5xx failures are worth retrying.
    pub const fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::RateLimited => true,
            _ => matches!(self.status, Some(status) if status >= 500),
        }
    }

    pub const fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// Failures that say nothing about one record and everything about the
    /// connection: the current cycle stops on these.
    pub const fn is_session_level(&self) -> bool {
        matches!(self.kind, ErrorKind::Auth) || self.is_retryable()
    }

    /// Session-level failures that mean "offline, will retry" rather than
    /// "error".
    pub const fn is_offline(&self) -> bool {
        matches!(self.kind, ErrorKind::Network | ErrorKind::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(RemoteError::from_status(401, "x").kind, ErrorKind::Auth);
        assert_eq!(RemoteError::from_status(403, "x").kind, ErrorKind::Auth);
        assert_eq!(RemoteError::from_status(404, "x").kind, ErrorKind::NotFound);
        assert_eq!(RemoteError::from_status(422, "x").kind, ErrorKind::Validation);
        assert_eq!(RemoteError::from_status(429, "x").kind, ErrorKind::RateLimited);
        assert_eq!(RemoteError::from_status(500, "x").kind, ErrorKind::Unknown);
        assert_eq!(RemoteError::from_status(418, "x").kind, ErrorKind::Unknown);
    }

    #[test]
    fn gateway_timeouts_are_network_timeouts() {
        let error = RemoteError::from_status(504, "upstream timed out");
        assert_eq!(error.kind, ErrorKind::Network);
        assert!(error.is_timeout());
        assert!(error.is_retryable());
    }

    #[test]
    fn retryability_follows_kind_and_status() {
        assert!(RemoteError::network("reset").is_retryable());
        assert!(RemoteError::rate_limited("slow down").is_retryable());
        assert!(RemoteError::from_status(503, "unavailable").is_retryable());
        assert!(!RemoteError::auth("bad token").is_retryable());
        assert!(!RemoteError::validation("bad field").is_retryable());
        assert!(!RemoteError::not_found("gone").is_retryable());
        assert!(!RemoteError::unknown("weird").is_retryable());
    }

    #[test]
    fn session_level_errors() {
        assert!(RemoteError::auth("bad token").is_session_level());
        assert!(RemoteError::network("reset").is_session_level());
        assert!(!RemoteError::validation("bad").is_session_level());
        assert!(!RemoteError::not_found("gone").is_session_level());
        assert!(!RemoteError::from_status(503, "down").is_offline());
    }
}
