//! Fault taxonomy for the grading pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::executor::ExecutorError;
use crate::harness::HarnessError;
use crate::progress::ProgressError;

/// Discriminant of a pipeline fault, exposed on every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The request itself is incomplete
    InvalidRequest,
    /// Unknown task or malformed task id
    Catalog,
    /// A static or runtime guard tripped
    SafetyRejection,
    /// The source does not compile under sandbox rules
    Compile,
    /// The submitted code raised
    Runtime,
    /// The wall-clock budget ran out
    Timeout,
    /// The task's test unit could not be located
    Resolution,
    /// The test unit failed to load or run
    Harness,
    /// The isolated worker could not be launched or returned nothing usable
    Worker,
    /// The progress store rejected the completion record
    Storage,
}

impl FaultKind {
    /// Faults caused by the deployment rather than by the submission.
    ///
    /// These are reported through `execution_error`; everything else goes
    /// to `error`.
    #[must_use]
    pub const fn is_operator_fault(self) -> bool {
        matches!(
            self,
            Self::Resolution | Self::Harness | Self::Worker | Self::Storage
        )
    }
}

/// A fault that stopped the grading pipeline
#[derive(Debug, Error)]
pub enum GradeError {
    /// Missing code or task id
    #[error("{0}")]
    InvalidRequest(String),

    /// Catalog lookup failed
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Guard tripped; message names the offending construct
    #[error("{0}")]
    SafetyRejection(String),

    /// Compiler diagnostic, verbatim
    #[error("{0}")]
    Compile(String),

    /// The exception's own message
    #[error("{0}")]
    Runtime(String),

    /// Templated timeout message
    #[error("{0}")]
    Timeout(String),

    /// Test unit could not be located, loaded or run
    #[error(transparent)]
    Harness(#[from] HarnessError),

    /// Worker infrastructure failure, rendered
    #[error("{0}")]
    Worker(String),

    /// Completion could not be recorded
    #[error(transparent)]
    Storage(#[from] ProgressError),
}

impl GradeError {
    /// Fault discriminant for this error
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::InvalidRequest(_) => FaultKind::InvalidRequest,
            Self::Catalog(_) => FaultKind::Catalog,
            Self::SafetyRejection(_) => FaultKind::SafetyRejection,
            Self::Compile(_) => FaultKind::Compile,
            Self::Runtime(_) => FaultKind::Runtime,
            Self::Timeout(_) => FaultKind::Timeout,
            Self::Harness(err) => err.kind(),
            Self::Worker(_) => FaultKind::Worker,
            Self::Storage(_) => FaultKind::Storage,
        }
    }
}

impl From<ExecutorError> for GradeError {
    fn from(err: ExecutorError) -> Self {
        Self::Worker(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ResolutionError;
    use std::path::PathBuf;

    #[test]
    fn test_submission_faults_are_not_operator_faults() {
        for kind in [
            FaultKind::InvalidRequest,
            FaultKind::Catalog,
            FaultKind::SafetyRejection,
            FaultKind::Compile,
            FaultKind::Runtime,
            FaultKind::Timeout,
        ] {
            assert!(!kind.is_operator_fault(), "{kind:?}");
        }
        assert!(FaultKind::Resolution.is_operator_fault());
        assert!(FaultKind::Harness.is_operator_fault());
    }

    #[test]
    fn test_messages_are_not_wrapped() {
        let err = GradeError::Runtime("division by zero".to_string());
        assert_eq!(err.to_string(), "division by zero");
        assert_eq!(err.kind(), FaultKind::Runtime);
    }

    #[test]
    fn test_resolution_is_distinct_from_harness() {
        let err = GradeError::from(HarnessError::from(ResolutionError::NotFound(
            PathBuf::from("basics/test_missing.py"),
        )));
        assert_eq!(err.kind(), FaultKind::Resolution);
        assert!(err.to_string().contains("basics/test_missing.py"));
    }

    #[test]
    fn test_fault_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FaultKind::SafetyRejection).unwrap();
        assert_eq!(json, "\"safety_rejection\"");
    }

    #[test]
    fn test_worker_error_keeps_detail() {
        let err = GradeError::from(ExecutorError::NoReply("worker exited with signal: 9".to_string()));
        assert_eq!(err.kind(), FaultKind::Worker);
        assert_eq!(err.to_string(), "no result from worker: worker exited with signal: 9");
    }
}
