//! Munin error types and failure classification.

use std::fmt;

/// Channel-level reply codes that indicate a recoverable condition.
///
/// 311 (content-too-large), 320 (connection-forced), 405 (resource-locked)
/// can succeed against a recovered channel. 403 (access-refused),
/// 404 (not-found), 406 (precondition-failed) are application mistakes and
/// never retried.
pub const RECOVERABLE_CHANNEL_CODES: &[u16] = &[311, 320, 405];

/// Signal raised by the broker client when a channel or connection closes.
///
/// `hard` distinguishes connection-level closure (the whole transport is
/// gone) from channel-level closure (the connection survives).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    /// Broker reply code, e.g. 320 for connection-forced.
    pub reply_code: u16,
    /// Human-readable reply text from the broker.
    pub reason: String,
    /// True for connection-level closure, false for channel-level.
    pub hard: bool,
}

impl ShutdownSignal {
    /// Connection-level (hard) closure.
    pub fn connection(reply_code: u16, reason: impl Into<String>) -> Self {
        Self {
            reply_code,
            reason: reason.into(),
            hard: true,
        }
    }

    /// Channel-level (soft) closure.
    pub fn channel(reply_code: u16, reason: impl Into<String>) -> Self {
        Self {
            reply_code,
            reason: reason.into(),
            hard: false,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = if self.hard { "connection" } else { "channel" };
        write!(f, "{} closed (code {}): {}", scope, self.reply_code, self.reason)
    }
}

/// Munin error types
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum MuninError {
    /// The underlying transport (connection or channel) shut down.
    #[error("transport shut down: {0}")]
    Shutdown(ShutdownSignal),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Application-level mistake: bad exchange type, invalid argument,
    /// operation on a deleted entity. Never retried.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The façade was closed or aborted.
    #[error("resource is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MuninError {
    /// The shutdown signal behind this error, if it is a transport failure.
    ///
    /// Used by the retry engine to decide whether to arbitrate with the
    /// recovery circuit before the next attempt.
    pub fn shutdown_signal(&self) -> Option<&ShutdownSignal> {
        match self {
            Self::Shutdown(signal) => Some(signal),
            _ => None,
        }
    }

    /// Whether this error is a connection-level closure.
    ///
    /// Recovery failures caused by connection-level closure always escalate
    /// to the supervisor, which restarts the recovery pass from the top.
    pub fn is_connection_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(signal) if signal.hard)
    }

    /// Whether the operation may succeed on retry.
    ///
    /// Connection-level shutdowns and I/O errors are always the retryable
    /// kind; channel-level shutdowns only for reply codes in
    /// [`RECOVERABLE_CHANNEL_CODES`]; authentication failures only when the
    /// policy opts in. Application errors are permanent.
    pub fn is_retryable(&self, retry_auth_failures: bool) -> bool {
        match self {
            Self::Shutdown(signal) => {
                signal.hard || RECOVERABLE_CHANNEL_CODES.contains(&signal.reply_code)
            }
            Self::Io(_) => true,
            Self::Authentication(_) => retry_auth_failures,
            Self::InvalidOperation(_) | Self::Closed | Self::Configuration(_) => false,
        }
    }
}

impl From<std::io::Error> for MuninError {
    fn from(err: std::io::Error) -> Self {
        MuninError::Io(err.to_string())
    }
}

/// Result type alias for Munin operations
pub type Result<T> = std::result::Result<T, MuninError>;
