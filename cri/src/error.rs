//! CRI-specific error conversions.

use dockershim_core::ShimError;
use tonic::Status;

/// Convert a ShimError to a gRPC Status.
pub fn status_from_error(err: ShimError) -> Status {
    let message = err.to_string();
    match err {
        ShimError::NotFound { .. } => Status::not_found(message),
        ShimError::AlreadyExists { .. } => Status::already_exists(message),
        ShimError::InvalidArgument(_) => Status::invalid_argument(message),
        ShimError::Conflict { .. } => Status::failed_precondition(message),
        ShimError::Unavailable(_) => Status::unavailable(message),
        ShimError::Internal { .. } => Status::internal(message),
        ShimError::Stalled { .. } => Status::deadline_exceeded(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockershim_core::EntityKind;
    use std::time::Duration;

    #[test]
    fn test_not_found_maps_to_not_found() {
        let err = ShimError::not_found(EntityKind::Container, "abc", "no such container");
        let status = status_from_error(err);
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("abc"));
    }

    #[test]
    fn test_conflict_maps_to_failed_precondition() {
        let err = ShimError::conflict(EntityKind::Container, "abc", "container is running");
        assert_eq!(status_from_error(err).code(), tonic::Code::FailedPrecondition);
    }

    #[test]
    fn test_stalled_maps_to_deadline_exceeded() {
        let err = ShimError::Stalled {
            reference: "busybox:latest".to_string(),
            deadline: Duration::from_secs(30),
        };
        assert_eq!(status_from_error(err).code(), tonic::Code::DeadlineExceeded);
    }

    #[test]
    fn test_unavailable_maps_to_unavailable() {
        let err = ShimError::Unavailable("connection refused".to_string());
        assert_eq!(status_from_error(err).code(), tonic::Code::Unavailable);
    }

    #[test]
    fn test_remaining_variants() {
        let cases = [
            (
                ShimError::AlreadyExists {
                    kind: EntityKind::Sandbox,
                    id: "sb".to_string(),
                },
                tonic::Code::AlreadyExists,
            ),
            (
                ShimError::InvalidArgument("bad".to_string()),
                tonic::Code::InvalidArgument,
            ),
            (
                ShimError::internal(EntityKind::Image, "img", "odd response"),
                tonic::Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(status_from_error(err).code(), code);
        }
    }
}
