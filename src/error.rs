use crate::message::Subsystem;
use thiserror::Error;

/// Errors emitted by the integration bus.
///
/// Every failure surfaced to a caller is one of these variants; callers
/// pattern-match instead of parsing strings. `Validation` and `Config` are
/// synchronous and non-retryable. `Connection` is raised only after the
/// retry budget is exhausted. `Timeout` and `Handler` are recorded in
/// metrics and acknowledgments but never abort the processing loop.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("message `{message_id}` failed validation: {reason}")]
    Validation { message_id: String, reason: String },

    #[error("handler `{handler}` failed for message `{message_id}`: {reason}")]
    Handler {
        handler: String,
        message_id: String,
        reason: String,
    },

    #[error("connection to {subsystem} failed after {attempts} attempt(s): {reason}")]
    Connection {
        subsystem: Subsystem,
        attempts: u32,
        reason: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("unresolved sync conflict: {description}")]
    Conflict { description: String },

    #[error("state sync failed: {reason}")]
    Sync { reason: String },

    #[error("channel to {subsystem} is not connected")]
    NotConnected { subsystem: Subsystem },
}

impl BusError {
    pub fn validation(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the bus may retry the failed operation. The bridge's
    /// connect loop bails out early on non-retryable failures instead of
    /// burning the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Sync { .. }
        )
    }
}
