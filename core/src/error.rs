use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Sandbox,
    Container,
    Image,
    Session,
    Exec,
    Engine,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandbox => write!(f, "sandbox"),
            Self::Container => write!(f, "container"),
            Self::Image => write!(f, "image"),
            Self::Session => write!(f, "streaming session"),
            Self::Exec => write!(f, "exec"),
            Self::Engine => write!(f, "engine"),
        }
    }
}

/// Shim error taxonomy.
///
/// Raw engine failures are classified into one of these variants before they
/// leave the runtime or image service, with the offending entity attached.
#[derive(Error, Debug)]
pub enum ShimError {
    /// Entity does not exist (or a streaming token is unknown, used or expired).
    #[error("{kind} {id} not found: {message}")]
    NotFound {
        kind: EntityKind,
        id: String,
        message: String,
    },

    /// Entity already exists
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    /// Request was malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Illegal state transition
    #[error("Conflict on {kind} {id}: {message}")]
    Conflict {
        kind: EntityKind,
        id: String,
        message: String,
    },

    /// Engine unreachable or timed out
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Unexpected engine response
    #[error("Internal error on {kind} {id}: {message}")]
    Internal {
        kind: EntityKind,
        id: String,
        message: String,
    },

    /// Image pull made no progress within the deadline
    #[error("Image pull stalled: {reference} made no progress for {deadline:?}")]
    Stalled {
        reference: String,
        deadline: Duration,
    },
}

impl ShimError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn conflict(kind: EntityKind, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn internal(kind: EntityKind, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            kind,
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::InvalidArgument(format!("serialization: {}", err))
    }
}

impl From<serde_yaml::Error> for ShimError {
    fn from(err: serde_yaml::Error) -> Self {
        ShimError::InvalidArgument(format!("configuration: {}", err))
    }
}

/// Result type alias for shim operations
pub type Result<T> = std::result::Result<T, ShimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = ShimError::not_found(EntityKind::Container, "abc", "no such container");
        assert_eq!(error.to_string(), "container abc not found: no such container");
        assert!(error.is_not_found());
    }

    #[test]
    fn test_conflict_display() {
        let error = ShimError::conflict(EntityKind::Container, "abc", "container is running");
        assert_eq!(
            error.to_string(),
            "Conflict on container abc: container is running"
        );
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_stalled_display() {
        let error = ShimError::Stalled {
            reference: "busybox:latest".to_string(),
            deadline: Duration::from_secs(30),
        };
        assert_eq!(
            error.to_string(),
            "Image pull stalled: busybox:latest made no progress for 30s"
        );
    }

    #[test]
    fn test_internal_display() {
        let error = ShimError::internal(EntityKind::Sandbox, "sb1", "missing state");
        assert_eq!(error.to_string(), "Internal error on sandbox sb1: missing state");
    }

    #[test]
    fn test_session_kind_display() {
        assert_eq!(EntityKind::Session.to_string(), "streaming session");
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: ShimError = result.unwrap_err().into();
        assert!(matches!(error, ShimError::InvalidArgument(_)));
    }
}
