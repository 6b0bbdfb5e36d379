//! Isolation errors

use std::time::Duration;

use switchboard_common::{ActivatorError, HandlerError, LifecycleError};
use uuid::Uuid;

/// Failures talking to, or managing, an isolation boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BoundaryError {
    #[error("Failed to launch boundary: {0}")]
    Launch(String),

    #[error("Boundary did not become ready: {0}")]
    NotReady(String),

    #[error("Boundary is not running")]
    NotRunning,

    #[error("Boundary channel closed")]
    Disconnected,

    #[error("Boundary call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Boundary rejected request: {0}")]
    Remote(String),

    #[error("Unexpected reply from boundary: {0}")]
    UnexpectedReply(String),
}

impl From<BoundaryError> for HandlerError {
    fn from(err: BoundaryError) -> Self {
        match err {
            BoundaryError::Timeout(after) => HandlerError::Timeout(after),
            other => HandlerError::Unavailable(other.to_string()),
        }
    }
}

/// Why an activation did not produce an instance.
#[derive(Debug, thiserror::Error)]
pub enum ActivationCause {
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error(transparent)]
    Activator(#[from] ActivatorError),

    #[error("host failed to start: {0}")]
    HostStart(#[from] LifecycleError),

    #[error("host start was vetoed")]
    HostStartVetoed,

    #[error("host {0} is not running")]
    HostNotRunning(Uuid),
}

/// Raised by every activation entry point. Always names the type that could
/// not be activated and keeps the underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("Unable to activate instance of {type_name}: {cause}")]
pub struct ActivationError {
    pub type_name: String,
    #[source]
    pub cause: ActivationCause,
}

impl ActivationError {
    pub fn new(type_name: impl Into<String>, cause: impl Into<ActivationCause>) -> Self {
        Self {
            type_name: type_name.into(),
            cause: cause.into(),
        }
    }
}
