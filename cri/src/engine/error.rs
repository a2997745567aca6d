use std::time::Duration;

use thiserror::Error;

use dockershim_core::{EntityKind, ShimError};

/// Raw engine failure, before classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Connection refused, broken pipe, TLS failure, ...
    #[error("engine transport error: {0}")]
    Transport(String),

    /// Non-success HTTP response.
    #[error("engine returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The bounded request timeout elapsed.
    #[error("engine request did not complete within {0:?}")]
    DeadlineExceeded(Duration),

    /// The response did not have the expected shape.
    #[error("malformed engine response: {0}")]
    Malformed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::status(409, message)
    }

    pub fn not_modified(message: impl Into<String>) -> Self {
        Self::status(304, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Start of a running container or stop of a stopped one.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::Status { status: 304, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status: 409, .. })
    }

    /// Map into the shim taxonomy, attaching the entity the call was about.
    pub fn classify(self, kind: EntityKind, id: &str) -> ShimError {
        match self {
            Self::Status { status: 404, message } => ShimError::not_found(kind, id, message),
            Self::Status { status: 409, message } => ShimError::conflict(kind, id, message),
            Self::Status { status: 400, message } => {
                ShimError::InvalidArgument(format!("{} {}: {}", kind, id, message))
            }
            err @ (Self::Transport(_) | Self::DeadlineExceeded(_)) => {
                ShimError::Unavailable(format!("{} {}: {}", kind, id, err))
            }
            other => ShimError::internal(kind, id, other.to_string()),
        }
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::Status {
                status: status_code,
                message,
            },
            Error::DockerStreamError { error } => Self::status(500, error),
            err @ (Error::JsonDataError { .. } | Error::JsonSerdeError { .. }) => {
                Self::Malformed(err.to_string())
            }
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = EngineError::not_found("No such container: abc");
        assert!(err.is_not_found());
        let shim = err.classify(EntityKind::Container, "abc");
        assert!(matches!(
            shim,
            ShimError::NotFound {
                kind: EntityKind::Container,
                ref id,
                ..
            } if id == "abc"
        ));
    }

    #[test]
    fn test_classify_conflict() {
        let shim = EngineError::conflict("container is running").classify(EntityKind::Container, "c1");
        assert!(matches!(shim, ShimError::Conflict { .. }));
    }

    #[test]
    fn test_classify_bad_request() {
        let shim = EngineError::status(400, "bad mount").classify(EntityKind::Container, "c1");
        assert!(matches!(shim, ShimError::InvalidArgument(ref m) if m.contains("bad mount")));
    }

    #[test]
    fn test_classify_unavailable() {
        let shim = EngineError::Transport("connection refused".to_string())
            .classify(EntityKind::Sandbox, "s1");
        assert!(matches!(shim, ShimError::Unavailable(_)));

        let shim = EngineError::DeadlineExceeded(Duration::from_secs(120))
            .classify(EntityKind::Image, "busybox");
        assert!(matches!(shim, ShimError::Unavailable(_)));
    }

    #[test]
    fn test_classify_internal() {
        let shim = EngineError::status(500, "boom").classify(EntityKind::Container, "c1");
        assert!(matches!(shim, ShimError::Internal { .. }));

        let shim = EngineError::Malformed("missing id".to_string())
            .classify(EntityKind::Container, "c1");
        assert!(matches!(shim, ShimError::Internal { .. }));
    }

    #[test]
    fn test_not_modified() {
        assert!(EngineError::not_modified("already started").is_not_modified());
        assert!(!EngineError::not_found("x").is_not_modified());
    }

    #[test]
    fn test_from_bollard_server_error() {
        let err: EngineError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image".to_string(),
        }
        .into();
        assert!(err.is_not_found());
    }
}
