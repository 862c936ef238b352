//! Error types for the dispatch core.

use thiserror::Error;

use crate::domain::payment::PaymentId;
use crate::domain::request::{RequestId, RequestStatus};

/// Result type alias using the towline error type.
pub type Result<T> = std::result::Result<T, TowlineError>;

/// Main error type for the dispatch core.
#[derive(Error, Debug)]
pub enum TowlineError {
    /// Latitude/longitude malformed or out of range
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    /// Request not found
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// Payment not found
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// The caller lacks the capability required for the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Another service won the acceptance race. Callers should re-query candidates.
    #[error("Request {0} is no longer pending (already assigned)")]
    AlreadyAssigned(RequestId),

    /// Requested status change is not in the transition table
    #[error("Invalid transition for request {id}: '{from}' -> '{to}'")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Entity is in the wrong state for a non-transition operation
    #[error("Invalid state: {entity} is '{actual}', expected '{expected}'")]
    InvalidState {
        entity: String,
        actual: String,
        expected: String,
    },

    /// Validation error (e.g., empty problem type, non-positive radius)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow (storage and transport failures)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TowlineError {
    /// Whether the caller can fix this by changing its input or re-polling.
    ///
    /// Boundary layers use this to pick between 4xx-style and 5xx-style responses.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, TowlineError::Serialization(_) | TowlineError::Other(_))
    }

    /// Machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            TowlineError::InvalidCoordinates(_) => "InvalidCoordinates",
            TowlineError::NotFound(_) | TowlineError::PaymentNotFound(_) => "NotFound",
            TowlineError::Forbidden(_) => "Forbidden",
            TowlineError::AlreadyAssigned(_) => "AlreadyAssigned",
            TowlineError::InvalidTransition { .. } => "InvalidTransition",
            TowlineError::InvalidState { .. } => "InvalidState",
            TowlineError::Validation(_) => "Validation",
            TowlineError::Serialization(_) => "Serialization",
            TowlineError::Other(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_already_assigned_is_client_error() {
        let err = TowlineError::AlreadyAssigned(RequestId::from(Uuid::new_v4()));
        assert!(err.is_client_error());
        assert_eq!(err.code(), "AlreadyAssigned");
    }

    #[test]
    fn test_storage_failure_is_not_client_error() {
        let err = TowlineError::Other(anyhow::anyhow!("connection reset"));
        assert!(!err.is_client_error());
        assert_eq!(err.code(), "Internal");
    }

    #[test]
    fn test_invalid_transition_message() {
        let id = RequestId::from(Uuid::new_v4());
        let err = TowlineError::InvalidTransition {
            id,
            from: RequestStatus::Completed,
            to: RequestStatus::Pending,
        };
        assert!(err.to_string().contains("'completed' -> 'pending'"));
    }
}
