//! Upload allow-lists, checked before any bytes reach the blob store

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_EVIDENCE_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_DOCUMENT_MAX_BYTES: u64 = 200 * 1024 * 1024;

const EVIDENCE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "application/pdf"];

const DOCUMENT_TYPE_PREFIXES: &[&str] =
    &["application/pdf", "image/", "video/", "application/msword"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// Proof attached to a negative transition
    Evidence,
    /// Closing contracts and other long-form documents
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub evidence_max_bytes: u64,
    pub document_max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            evidence_max_bytes: DEFAULT_EVIDENCE_MAX_BYTES,
            document_max_bytes: DEFAULT_DOCUMENT_MAX_BYTES,
        }
    }
}

impl UploadPolicy {
    pub fn max_bytes(&self, kind: UploadKind) -> u64 {
        match kind {
            UploadKind::Evidence => self.evidence_max_bytes,
            UploadKind::Document => self.document_max_bytes,
        }
    }

    /// Reject empty, oversized or disallowed uploads
    pub fn check(
        &self,
        kind: UploadKind,
        content_type: &str,
        size: u64,
    ) -> Result<(), PipelineError> {
        if size == 0 {
            return Err(PipelineError::Validation("Upload is empty".into()));
        }

        let max = self.max_bytes(kind);
        if size > max {
            return Err(PipelineError::Validation(format!(
                "Upload of {} bytes exceeds the {} byte limit",
                size, max
            )));
        }

        let content_type = content_type.trim().to_ascii_lowercase();
        let allowed = match kind {
            UploadKind::Evidence => EVIDENCE_TYPES.contains(&content_type.as_str()),
            UploadKind::Document => {
                DOCUMENT_TYPE_PREFIXES.iter().any(|p| content_type.starts_with(p))
                    || content_type.starts_with("application/vnd.openxmlformats-officedocument")
            }
        };
        if !allowed {
            return Err(PipelineError::Validation(format!(
                "Content type {} is not allowed here",
                content_type
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_limits() {
        let policy = UploadPolicy::default();
        assert!(policy.check(UploadKind::Evidence, "image/png", 1024).is_ok());
        assert!(policy.check(UploadKind::Evidence, "Application/PDF", 1024).is_ok());
        assert!(policy
            .check(UploadKind::Evidence, "image/png", DEFAULT_EVIDENCE_MAX_BYTES + 1)
            .is_err());
        assert!(policy.check(UploadKind::Evidence, "video/mp4", 1024).is_err());
        assert!(policy.check(UploadKind::Evidence, "image/png", 0).is_err());
    }

    #[test]
    fn test_document_limits() {
        let policy = UploadPolicy::default();
        assert!(policy.check(UploadKind::Document, "video/mp4", 50 * 1024 * 1024).is_ok());
        assert!(policy
            .check(UploadKind::Document, "application/pdf", DEFAULT_DOCUMENT_MAX_BYTES)
            .is_ok());
        assert!(policy
            .check(UploadKind::Document, "application/pdf", DEFAULT_DOCUMENT_MAX_BYTES + 1)
            .is_err());
        assert!(policy.check(UploadKind::Document, "text/html", 10).is_err());
    }
}
