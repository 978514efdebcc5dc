//! Evidence gate
//!
//! Negative outcomes (rejections, no-shows, lost deals, rejected closings)
//! must cite an uploaded evidence row recorded for the same entity and target
//! status, and not yet consumed by an earlier movement.

use rusqlite::Connection;
use tracing::debug;

use crate::db::evidence::{get_evidence, is_consumed, EvidenceRow};
use crate::error::{GuardViolation, PipelineError};
use crate::pipeline::{EntityRef, PipelineState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Target status is not gated
    NotRequired,
    /// Cited evidence matches; the movement must reference it
    Satisfied { evidence_id: String },
}

impl GateDecision {
    pub fn evidence_id(&self) -> Option<&str> {
        match self {
            GateDecision::NotRequired => None,
            GateDecision::Satisfied { evidence_id } => Some(evidence_id),
        }
    }
}

/// Decide the gate from already-loaded facts
pub fn evaluate_gate(
    entity: &EntityRef,
    target: &str,
    requires_evidence: bool,
    evidence_id: Option<&str>,
    evidence: Option<&EvidenceRow>,
    consumed: bool,
) -> Result<GateDecision, GuardViolation> {
    if !requires_evidence {
        return Ok(GateDecision::NotRequired);
    }

    let missing = || GuardViolation::MissingEvidence {
        entity: entity.entity_type.as_str(),
        entity_id: entity.entity_id.clone(),
        to: target.to_string(),
    };

    let (id, row) = match (evidence_id, evidence) {
        (Some(id), Some(row)) => (id, row),
        _ => return Err(missing()),
    };

    let invalid = |reason: String| GuardViolation::InvalidEvidence {
        evidence_id: id.to_string(),
        reason,
    };

    if row.entity_type != entity.entity_type.as_str() || row.entity_id != entity.entity_id {
        return Err(invalid(format!(
            "recorded for {}:{}, not {}",
            row.entity_type, row.entity_id, entity
        )));
    }
    if row.to_status != target {
        return Err(invalid(format!("recorded for status {}, not {}", row.to_status, target)));
    }
    if consumed {
        return Err(invalid("already used by an earlier transition".into()));
    }

    Ok(GateDecision::Satisfied { evidence_id: id.to_string() })
}

/// Load the cited evidence and evaluate the gate for `target`
pub fn check_gate<S: PipelineState>(
    conn: &Connection,
    entity: &EntityRef,
    target: S,
    evidence_id: Option<&str>,
) -> Result<GateDecision, PipelineError> {
    if !target.requires_evidence() {
        return Ok(GateDecision::NotRequired);
    }

    let evidence_id = evidence_id.map(str::trim).filter(|id| !id.is_empty());
    let (row, consumed) = match evidence_id {
        Some(id) => match get_evidence(conn, id)? {
            Some(row) => {
                let consumed = is_consumed(conn, id)?;
                (Some(row), consumed)
            }
            None => (None, false),
        },
        None => (None, false),
    };

    let decision =
        evaluate_gate(entity, target.as_str(), true, evidence_id, row.as_ref(), consumed)?;
    debug!(entity = %entity, to = %target, decision = ?decision, "Evidence gate passed");
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TO: &str = "rejected_no_response";

    fn row(entity_id: &str, to_status: &str) -> EvidenceRow {
        EvidenceRow {
            id: "ev-1".into(),
            lead_id: entity_id.into(),
            tenant_id: Some("t1".into()),
            entity_type: "lead".into(),
            entity_id: entity_id.into(),
            from_status: Some("in_conversation".into()),
            to_status: to_status.into(),
            blob_key: "sha256-abc".into(),
            blob_url: "file:///x".into(),
            content_type: "image/png".into(),
            size_bytes: 10,
            file_name: None,
            uploaded_by: "s-1".into(),
            created_at: "now".into(),
        }
    }

    #[test]
    fn test_ungated_target_passes() {
        let entity = EntityRef::lead("L1");
        assert_eq!(
            evaluate_gate(&entity, "scheduled", false, None, None, false).unwrap(),
            GateDecision::NotRequired
        );
    }

    #[test]
    fn test_missing_or_unknown_id() {
        let entity = EntityRef::lead("L3");
        let err = evaluate_gate(&entity, TO, true, None, None, false).unwrap_err();
        assert!(matches!(err, GuardViolation::MissingEvidence { .. }));

        let err = evaluate_gate(&entity, TO, true, Some("ghost"), None, false).unwrap_err();
        assert!(matches!(err, GuardViolation::MissingEvidence { .. }));
    }

    #[test]
    fn test_mismatched_triple() {
        let entity = EntityRef::lead("L3");
        let other_lead = row("L4", "rejected_no_response");
        let err = evaluate_gate(&entity, TO, true, Some("ev-1"), Some(&other_lead), false)
            .unwrap_err();
        assert!(matches!(err, GuardViolation::InvalidEvidence { .. }));

        let other_status = row("L3", "no_show");
        let err = evaluate_gate(&entity, TO, true, Some("ev-1"), Some(&other_status), false)
            .unwrap_err();
        assert!(matches!(err, GuardViolation::InvalidEvidence { .. }));

        let appointment = EntityRef::appointment("L3");
        let err = evaluate_gate(&appointment, TO, true, Some("ev-1"), Some(&other_status), false)
            .unwrap_err();
        assert!(matches!(err, GuardViolation::InvalidEvidence { .. }));
    }

    #[test]
    fn test_consumed_evidence_rejected() {
        let entity = EntityRef::lead("L3");
        let good = row("L3", "rejected_no_response");
        assert!(evaluate_gate(&entity, TO, true, Some("ev-1"), Some(&good), false).is_ok());

        let err = evaluate_gate(&entity, TO, true, Some("ev-1"), Some(&good), true).unwrap_err();
        assert!(matches!(err, GuardViolation::InvalidEvidence { .. }));
    }
}
