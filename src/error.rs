//! Error types for referral-pipeline
//!
//! Validation, authorization, guard and conflict errors are terminal for a
//! request and are raised before any write. `Dependency` wraps store and blob
//! round-trip failures and is the only retryable class.

use thiserror::Error;

use crate::blob_store::BlobError;

/// Why a guarded transition was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("Illegal transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Evidence required for {entity} {entity_id} -> {to}")]
    MissingEvidence {
        entity: &'static str,
        entity_id: String,
        to: String,
    },

    #[error("Evidence {evidence_id} does not justify this transition: {reason}")]
    InvalidEvidence { evidence_id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Missing and out-of-scope rows are reported identically.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Guard violation: {0}")]
    Guard(#[from] GuardViolation),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Store and blob failures may succeed on retry; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_)
                | PipelineError::Io(_)
                | PipelineError::Blob(_)
                | PipelineError::Internal(_)
        )
    }

    /// Stable machine-readable class, used in CLI output and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Authorization(_) => "authorization",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Guard(_) => "guard_violation",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::Json(_) => "serialization",
            PipelineError::Database(_)
            | PipelineError::Io(_)
            | PipelineError::Blob(_)
            | PipelineError::Internal(_) => "dependency_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_dependency_failures_retry() {
        assert!(!PipelineError::Validation("x".into()).is_retryable());
        assert!(!PipelineError::Conflict("x".into()).is_retryable());
        assert!(PipelineError::Internal("lock".into()).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(PipelineError::from(io).is_retryable());
    }

    #[test]
    fn test_guard_kind() {
        let err: PipelineError = GuardViolation::MissingEvidence {
            entity: "lead",
            entity_id: "L3".into(),
            to: "rejected_no_response".into(),
        }
        .into();
        assert_eq!(err.kind(), "guard_violation");
        assert!(err.to_string().contains("rejected_no_response"));
    }
}
