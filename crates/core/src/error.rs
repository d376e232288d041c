//! Capability error model.

use thiserror::Error;

/// Result type returned by capability adapters.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Error raised by a backend adapter (package deployer, resource inspector, ...).
///
/// Adapters translate their SDK errors into one of these variants. The job
/// runtime only cares about the message and whether the failure is worth
/// retrying; everything backend-specific stays in the adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The backend could not be reached (connection refused, DNS, TLS...).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The requested resource does not exist in the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused the request (validation, conflict, permissions).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The backend did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl CapabilityError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a later attempt may succeed without caller intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CapabilityError::unavailable("conn refused").is_transient());
        assert!(CapabilityError::timeout("5s").is_transient());
        assert!(!CapabilityError::rejected("bad chart").is_transient());
        assert!(!CapabilityError::not_found("release").is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = CapabilityError::rejected("chart version 9.9.9 not found");
        assert_eq!(err.to_string(), "rejected: chart version 9.9.9 not found");
        assert_eq!(CapabilityError::other("boom").to_string(), "boom");
    }
}
