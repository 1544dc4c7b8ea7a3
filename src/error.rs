//! Admission Error Types
//!
//! Rejections are not errors: a caller over its limit gets a decision value.
//! The types here cover the cases where a check could not be completed at all.

use crate::rate_limit::store::StoreError;

/// Errors raised while evaluating an admission check
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Invalid rule set or role mapping
    #[error("Invalid admission configuration: {0}")]
    Configuration(String),

    /// Caller role has no entry in the role limits mapping
    #[error("No quota limits configured for role '{0}'")]
    UnknownRole(String),

    /// No rule matched the request (catch-all missing)
    #[error("No rate limit rule matches {method} {path}")]
    NoMatchingRule { path: String, method: String },

    /// Counter store failure
    #[error("Counter store error: {0}")]
    Storage(#[from] StoreError),

    /// Compare-and-swap retries exhausted for a hot key
    #[error("Gave up updating counter {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

impl AdmissionError {
    /// Configuration problems always fail open, regardless of policy
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AdmissionError::Configuration(_)
                | AdmissionError::UnknownRole(_)
                | AdmissionError::NoMatchingRule { .. }
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::Configuration(_)
            | AdmissionError::UnknownRole(_)
            | AdmissionError::NoMatchingRule { .. } => "configuration",
            AdmissionError::Storage(_) => "storage",
            AdmissionError::Contention { .. } => "contention",
        }
    }
}
