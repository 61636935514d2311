//! Error types for the hypervisor abstraction layer.
//!
//! Adapters translate every backend-native failure into [`HypervisorError`];
//! nothing backend specific crosses the [`crate::HypervisorClient`] boundary.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Cannot reach or authenticate to the backend. Never retried.
    #[error("Failed to connect to hypervisor: {0}")]
    Connection(String),

    /// The backend was reachable but the call failed, possibly after retries.
    /// Carries the backend's own error text.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// The addressed instance or snapshot does not exist on the backend.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not meaningful for this instance type.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// An asynchronous backend task did not finish within its ceiling.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl HypervisorError {
    /// True when the failure happened before any backend work was attempted
    /// because the backend could not be reached or refused the credentials.
    pub fn is_connection(&self) -> bool {
        matches!(self, HypervisorError::Connection(_))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Failure of a single HTTP exchange with a backend.
///
/// Transports return this; adapters decide retry versus fatal and then map it
/// into [`HypervisorError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset.
    #[error("connection error: {0}")]
    Connect(String),

    /// The backend rejected the credentials (401/403).
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Any other non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Timeouts, connection resets and gateway errors may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Status { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }

    /// Authentication/authorization failures are fatal immediately.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth { .. })
    }

    /// Build from an HTTP status code and the body the backend sent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 401 || status == 403 {
            TransportError::Auth { status, message }
        } else {
            TransportError::Status { status, message }
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::from_status(status.as_u16(), e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }
}

impl From<TransportError> for HypervisorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Auth { .. } => HypervisorError::Connection(e.to_string()),
            TransportError::Status { status: 404, message } => HypervisorError::NotFound(message),
            other => HypervisorError::Operation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout("t".into()).is_transient());
        assert!(TransportError::Connect("reset".into()).is_transient());
        assert!(TransportError::from_status(503, "busy").is_transient());
        assert!(!TransportError::from_status(500, "boom").is_transient());
        assert!(!TransportError::from_status(401, "no").is_transient());
        assert!(TransportError::from_status(403, "no").is_auth());
    }

    #[test]
    fn test_auth_maps_to_connection_error() {
        let err: HypervisorError = TransportError::from_status(401, "bad token").into();
        assert!(err.is_connection());

        let err: HypervisorError = TransportError::from_status(500, "VM is locked").into();
        assert_eq!(err, HypervisorError::Operation("HTTP 500: VM is locked".to_string()));
    }
}
