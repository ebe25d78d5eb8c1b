use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Error taxonomy for the analysis service.
///
/// `InvalidInput` and `NotFound` surface as 4xx responses. `InvalidTransition`
/// is the store rejecting an illegal status move; it reaches clients only when
/// they request one (cancelling a finished job) and maps to 409 there.
/// `UpstreamFailure` covers the language-model backend and surfaces as 502.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("job {0} was cancelled")]
    Cancelled(Uuid),

    #[error("job {0} is not ready for questions (status: {1})")]
    NotReady(Uuid, JobStatus),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let id = Uuid::new_v4();
        let err = AnalyzerError::NotFound(id);
        assert_eq!(err.to_string(), format!("job {} not found", id));

        let err = AnalyzerError::InvalidTransition {
            from: JobStatus::Complete,
            to: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid transition from complete to running");

        let err = AnalyzerError::StageFailure {
            stage: "fetch".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(err.to_string(), "stage 'fetch' failed: timed out");
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: AnalyzerError = anyhow::anyhow!("db exploded").into();
        assert!(matches!(err, AnalyzerError::Other(_)));
        assert_eq!(err.to_string(), "db exploded");
    }

    #[test]
    fn test_variants_are_matchable() {
        let id = Uuid::new_v4();
        let err = AnalyzerError::NotReady(id, JobStatus::Running);
        match err {
            AnalyzerError::NotReady(job_id, status) => {
                assert_eq!(job_id, id);
                assert_eq!(status, JobStatus::Running);
            }
            _ => panic!("expected NotReady"),
        }
    }
}
