//! Error types for the rate limit gate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for gate operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    /// A guard required a wait while the gate is configured to fail fast.
    #[error(
        "Rate limit exceeded by guard '{guard}' ({description}): {current}/{limit} per {period:?}, \
         weight {weight}, wait {wait:?}"
    )]
    RateLimitExceeded {
        guard: String,
        description: String,
        limit: u32,
        period: Duration,
        current: u64,
        weight: u32,
        wait: Duration,
    },

    /// The action's weight exceeds a guard's limit and can never be admitted.
    #[error("Action weight {weight} can never fit guard '{guard}' with limit {limit}")]
    Unsatisfiable { guard: String, limit: u32, weight: u32 },

    /// The caller's cancellation signal fired while waiting.
    #[error("Rate limit wait canceled")]
    Canceled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

impl GateError {
    /// Whether the same action may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::RateLimitExceeded { .. } | GateError::Canceled)
    }
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Io(err.to_string())
    }
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
