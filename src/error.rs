//! Polling error taxonomy

use thiserror::Error;

use crate::poll_result::PollResult;

/// Errors raised while polling a device
#[derive(Debug, Clone, Error)]
pub enum PollError {
    /// No registered adapter can handle the device
    #[error("no suitable adapter for device {device}")]
    NoSuitableAdapter { device: String },

    #[error("unsupported {protocol} version: {version}")]
    UnsupportedVersion { protocol: String, version: String },

    /// Capability present but missing something the adapter needs
    #[error("{adapter} not configured: {reason}")]
    NotConfigured { adapter: String, reason: String },

    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("authentication rejected by {target}")]
    Auth { target: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every candidate adapter was tried and none succeeded
    #[error("all {attempted} adapters failed, last error: {last_error}")]
    AllAdaptersFailed { attempted: usize, last_error: String },

    #[error("poll cancelled")]
    Cancelled,
}

impl PollError {
    /// Configuration errors will not go away by retrying sooner
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PollError::NoSuitableAdapter { .. }
                | PollError::UnsupportedVersion { .. }
                | PollError::NotConfigured { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PollError::Connect { .. }
                | PollError::Timeout { .. }
                | PollError::Auth { .. }
                | PollError::Protocol(_)
        )
    }
}

/// A session could not be established
///
/// The partially filled result is carried along with `success == false` and
/// the same message in its `error` field, so callers can treat it exactly
/// like an unsuccessful `Ok` result.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SessionFailure {
    pub error: PollError,
    pub result: Box<PollResult>,
}

impl SessionFailure {
    pub fn new(error: PollError, mut result: PollResult) -> Self {
        result.fail(error.to_string());
        Self {
            error,
            result: Box::new(result),
        }
    }
}
