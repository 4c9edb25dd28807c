//! Error surface of the orchestration API.

use thiserror::Error;

use crate::job::store::StoreError;
use crate::queue::QueueError;

/// Errors returned by [`Orchestrator`](crate::orchestrator::Orchestrator)
/// operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request is malformed; retrying it unchanged cannot succeed.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// The state store refused the write. Nothing was published.
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("queue transport: {0}")]
    Transport(#[from] QueueError),

    #[error("message codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("internal: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        CoreError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal {
            message: message.into(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable { message } => CoreError::StorageUnavailable { message },
            StoreError::JobNotFound { job_id } => CoreError::JobNotFound { job_id },
            other => CoreError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailability_maps_to_storage_unavailable() {
        let err = CoreError::from(StoreError::Unavailable {
            message: "connection refused".into(),
        });
        assert!(matches!(err, CoreError::StorageUnavailable { .. }));
    }

    #[test]
    fn missing_job_maps_to_job_not_found() {
        let err = CoreError::from(StoreError::JobNotFound {
            job_id: "j-1".into(),
        });
        match err {
            CoreError::JobNotFound { job_id } => assert_eq!(job_id, "j-1"),
            other => panic!("unexpected: {other}"),
        }
    }
}
