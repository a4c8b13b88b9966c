//! Custom error types for the application.

use thiserror::Error;

/// Primary error type for the mediator.
///
/// Every variant maps onto one HTTP status at the transport boundary; inside
/// the process errors travel as failed promises carrying this type.
#[derive(Error, Debug)]
pub enum MediatorError {
    /// Transport broken, remote unreachable, socket closed.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Well-formed protocol, semantically invalid (unknown object, bad
    /// session, type mismatch).
    #[error("{0}")]
    Request(String),

    /// Login or authentication failure.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A synchronous read/write did not complete in time. The underlying
    /// operation keeps running; its effect may still apply.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Historian modify precondition violated (Insert on duplicate,
    /// Update on missing).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The historian worker has shut down; no further submissions.
    #[error("Historian worker terminated")]
    Terminated,

    /// Request refused because module startup is still in progress.
    #[error("Service starting up")]
    ServiceUnavailable,

    /// Unexpected condition; logged with detail, reported opaquely.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediatorError {
    pub fn request(msg: impl Into<String>) -> MediatorError {
        MediatorError::Request(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> MediatorError {
        MediatorError::Internal(msg.into())
    }

    /// HTTP status code implied by the taxonomy kind.
    pub fn http_status(&self) -> u16 {
        match self {
            MediatorError::Connectivity(_) => 502,
            MediatorError::Request(_) => 400,
            MediatorError::Auth(_) => 401,
            MediatorError::Timeout(_) => 408,
            MediatorError::Conflict(_) => 409,
            MediatorError::Terminated => 500,
            MediatorError::ServiceUnavailable => 503,
            MediatorError::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for MediatorError {
    fn from(e: rusqlite::Error) -> MediatorError {
        MediatorError::Internal(format!("sqlite: {e}"))
    }
}

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, MediatorError>;
