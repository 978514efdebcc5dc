//! Movement audit log
//!
//! Every transition, claim and assignment appends one movement. Inside a unit
//! of work the insert runs in its own savepoint: if it fails, only the
//! savepoint is rolled back, a warning is logged and the business write still
//! commits.

use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::actor::Actor;
use crate::db::movements::{self, MovementRow, NewMovement};
use crate::error::PipelineError;
use crate::pipeline::EntityRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    LeadCreated,
    LeadClaimed,
    StatusChanged,
    AppointmentCreated,
    AppointmentRescheduled,
    AppointmentStatusChanged,
    ClosingCreated,
    ClosingReviewed,
    ClosingUpdated,
    InternalConsultantAssigned,
    LeadDeleted,
    EvidenceUploaded,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::LeadCreated => "lead_created",
            MovementKind::LeadClaimed => "lead_claimed",
            MovementKind::StatusChanged => "status_changed",
            MovementKind::AppointmentCreated => "appointment_created",
            MovementKind::AppointmentRescheduled => "appointment_rescheduled",
            MovementKind::AppointmentStatusChanged => "appointment_status_changed",
            MovementKind::ClosingCreated => "closing_created",
            MovementKind::ClosingReviewed => "closing_reviewed",
            MovementKind::ClosingUpdated => "closing_updated",
            MovementKind::InternalConsultantAssigned => "internal_consultant_assigned",
            MovementKind::LeadDeleted => "lead_deleted",
            MovementKind::EvidenceUploaded => "evidence_uploaded",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fact to append
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub kind: MovementKind,
    pub entity: EntityRef,
    pub description: String,
    pub related_consultant_ids: Vec<String>,
    pub tenant_id: Option<String>,
    pub evidence_id: Option<String>,
}

impl AuditEntry {
    pub fn new(kind: MovementKind, entity: EntityRef, description: impl Into<String>) -> Self {
        Self {
            kind,
            entity,
            description: description.into(),
            related_consultant_ids: Vec::new(),
            tenant_id: None,
            evidence_id: None,
        }
    }

    pub fn related(mut self, ids: Vec<String>) -> Self {
        self.related_consultant_ids = ids;
        self
    }

    pub fn tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn evidence(mut self, evidence_id: Option<String>) -> Self {
        self.evidence_id = evidence_id;
        self
    }
}

/// Append a movement. Errors propagate.
pub fn record(
    conn: &Connection,
    actor: &Actor,
    entry: &AuditEntry,
) -> Result<MovementRow, PipelineError> {
    let row = movements::insert_movement(
        conn,
        &NewMovement {
            kind: entry.kind.as_str(),
            entity_type: entry.entity.entity_type.as_str(),
            entity_id: &entry.entity.entity_id,
            actor_id: actor.self_id(),
            actor_role: actor.role().as_str(),
            description: &entry.description,
            related_consultant_ids: &entry.related_consultant_ids,
            tenant_id: entry.tenant_id.as_deref(),
            evidence_id: entry.evidence_id.as_deref(),
        },
    )?;
    debug!(kind = %entry.kind, entity = %entry.entity, seq = row.seq, "Recorded movement");
    Ok(row)
}

/// Append a movement inside `tx` without putting the surrounding unit of
/// work at risk. Returns `None` when the insert failed.
pub fn record_best_effort(
    tx: &mut Transaction<'_>,
    actor: &Actor,
    entry: &AuditEntry,
) -> Option<MovementRow> {
    let result = tx
        .savepoint()
        .map_err(PipelineError::from)
        .and_then(|sp| {
            let row = record(&sp, actor, entry)?;
            sp.commit()?;
            Ok(row)
        });

    match result {
        Ok(row) => Some(row),
        Err(e) => {
            warn!(
                kind = %entry.kind,
                entity = %entry.entity,
                error = %e,
                "Failed to record movement"
            );
            None
        }
    }
}
