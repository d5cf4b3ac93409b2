//! Error taxonomy for the fleet controller.

use thiserror::Error;

/// Errors surfaced by the Registry, InstanceManager, and Controller.
///
/// `ConfigWarning` is deliberately absent: it is never fatal to an
/// operation, so it is logged via `tracing::warn!` at the point it is
/// detected rather than carried as a variant here.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("runtime reports instance '{0}' no longer exists")]
    RuntimeNotFound(String),

    #[error("container runtime call failed: {0}")]
    RuntimeTransient(String),

    #[error("capacity exhausted: reservation slot unavailable")]
    CapacityExhausted,

    #[error("health check failed for '{0}': {1}")]
    HealthFailure(String, String),

    #[error("internal error: {0}")]
    FatalInternal(String),

    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<String> for ControllerError {
    fn from(s: String) -> Self {
        ControllerError::FatalInternal(s)
    }
}

impl From<&str> for ControllerError {
    fn from(s: &str) -> Self {
        ControllerError::FatalInternal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exhausted_has_no_payload_but_displays() {
        let e = ControllerError::CapacityExhausted;
        assert_eq!(e.to_string(), "capacity exhausted: reservation slot unavailable");
    }

    #[test]
    fn string_conversions_land_as_fatal_internal() {
        let e: ControllerError = "boom".into();
        assert!(matches!(e, ControllerError::FatalInternal(_)));
    }
}
