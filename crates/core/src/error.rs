use thiserror::Error;

use crate::AppState;

/// Errors surfaced by the provisioning orchestrator.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("name not available: {0}")]
    NameNotAvailable(String),
    #[error("invalid application name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("missing required env: {}", keys.join(", "))]
    MissingRequiredEnv { keys: Vec<String> },
    #[error("unsupported application kind: {0}")]
    UnsupportedApplicationKind(String),
    #[error("application {0} has no source repository to build")]
    MissingSource(String),
    #[error("cannot {op} for application {app} while {state}")]
    InvalidState { app: String, state: AppState, op: String },
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("store: {0}")]
    Store(String),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("queue: {0}")]
    Queue(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any side effect.
    Validation,
    InvalidState,
    NotFound,
    Infrastructure,
    Cancelled,
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::NameNotAvailable(_)
            | PlatformError::InvalidName { .. }
            | PlatformError::MissingRequiredEnv { .. }
            | PlatformError::UnsupportedApplicationKind(_)
            | PlatformError::MissingSource(_) => ErrorKind::Validation,
            PlatformError::InvalidState { .. } => ErrorKind::InvalidState,
            PlatformError::NotFound(_) => ErrorKind::NotFound,
            PlatformError::Store(_) | PlatformError::Cluster(_) | PlatformError::Queue(_) => ErrorKind::Infrastructure,
            PlatformError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_validation(&self) -> bool { self.kind() == ErrorKind::Validation }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_readable() {
        let e = PlatformError::MissingRequiredEnv { keys: vec!["A".into(), "B".into()] };
        assert_eq!(e.to_string(), "missing required env: A, B");
        let e = PlatformError::InvalidState { app: "alpha".into(), state: AppState::Building, op: "request build".into() };
        assert_eq!(e.to_string(), "cannot request build for application alpha while building");
        assert_eq!(e.kind(), ErrorKind::InvalidState);
        assert!(PlatformError::NameNotAvailable("x".into()).is_validation());
        assert_eq!(PlatformError::Queue("down".into()).kind(), ErrorKind::Infrastructure);
    }
}
