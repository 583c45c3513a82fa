//! Error types for Heal Core
//!
//! Provides error handling for:
//! - Collaborator (service) failures and timeouts
//! - Malformed event payloads rejected at dispatch
//! - Coordinator lifecycle and workflow table misuse
//! - Configuration loading and validation

use crate::types::Stage;
use heal_events::{BusError, CorrelationId};

/// Main coordinator error type
#[derive(Debug, thiserror::Error)]
pub enum HealError {
    /// Coordinator already started
    #[error("coordinator already running")]
    AlreadyRunning,

    /// Coordinator was shut down and cannot be restarted
    #[error("coordinator has been shut down")]
    Stopped,

    /// No workflow record for this correlation id
    #[error("no workflow for correlation id {0}")]
    UnknownWorkflow(CorrelationId),

    /// Stage transition not allowed by the state machine
    #[error("illegal stage transition: {from} -> {to}")]
    IllegalTransition {
        /// Current stage
        from: Stage,
        /// Requested stage
        to: Stage,
    },

    /// Event bus failure
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Collaborator errors
///
/// Every error a diagnosis, patch, guardrail, apply or verification service
/// can raise. The coordinator never retries; retry is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Backend unreachable or refused the call
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Call did not finish within the stage timeout
    #[error("{service} timed out after {duration_secs}s")]
    Timeout {
        /// Service name
        service: String,
        /// Timeout that elapsed
        duration_secs: u64,
    },

    /// Requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Input rejected by the service
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Check if error is retryable by a caller
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }

    /// Check if error is an elapsed timeout
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Event payload rejected at the dispatch boundary
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    /// Payload must be a JSON object
    #[error("payload is not an object")]
    NotAnObject,

    /// Required field missing or empty
    #[error("missing field: {0}")]
    Missing(&'static str),

    /// Score outside [0, 1]
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: f64,
    },

    /// Payload could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML could not be parsed
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// Value out of bounds
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}
