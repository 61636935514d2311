//! Error types for rental operations.

use thiserror::Error;
use uuid::Uuid;
use vmrent_hypervisor::HypervisorError;

/// Errors surfaced by the controller, synchronizer and linking job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RentalError {
    /// A local invariant was violated before any backend call.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The operation is not allowed from the instance's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A local record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// Failure reported by the persistence layer.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Failure reported by a backend adapter.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl RentalError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        RentalError::NotFound { kind, id }
    }

    /// True for adapter errors of the "unsupported for this instance type"
    /// kind.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, RentalError::Hypervisor(HypervisorError::Unsupported(_)))
    }
}

/// Result type alias for rental operations.
pub type Result<T> = std::result::Result<T, RentalError>;
