//! Evidence and contract uploads
//!
//! Bytes go to the blob store first (content-addressed, so a retried upload
//! rewrites the same key); the database row is written afterwards in its own
//! unit of work. The connection lock is never held across an await.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;
use tracing::info;

use crate::actor::Actor;
use crate::audit::{self, AuditEntry, MovementKind};
use crate::blob_store::{compute_key, BlobStore};
use crate::db::appointments;
use crate::db::closings::{self, ClosingRow};
use crate::db::evidence::{self, EvidenceRow, NewEvidence};
use crate::db::leads;
use crate::db::PipelineDb;
use crate::error::PipelineError;
use crate::pipeline::{
    AppointmentStatus, ClosingApproval, EntityRef, EntityType, LeadStatus, PipelineState,
};
use crate::scope::{resolve_lead_scope, resolve_scope, Predicate, ScopedTable};
use crate::upload::{UploadKind, UploadPolicy};

use super::events::{EventBus, PipelineEvent};

/// A proof file for a pending negative transition
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceUpload {
    pub entity: EntityRef,
    /// Status the evidence will justify
    pub to_status: String,
    pub content_type: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// What the target entity looks like right now
struct EntityFacts {
    lead_id: String,
    tenant_id: Option<String>,
    from_status: String,
}

pub struct EvidenceService {
    db: Arc<PipelineDb>,
    blobs: Arc<dyn BlobStore>,
    events: Arc<EventBus>,
    policy: UploadPolicy,
}

/// Target status must exist for the entity and be one that needs evidence
fn gated_target(entity_type: EntityType, to_status: &str) -> Result<(), PipelineError> {
    let gated = match entity_type {
        EntityType::Lead => to_status.parse::<LeadStatus>()?.requires_evidence(),
        EntityType::Appointment => to_status.parse::<AppointmentStatus>()?.requires_evidence(),
        EntityType::Closing => to_status.parse::<ClosingApproval>()?.requires_evidence(),
    };
    if !gated {
        return Err(PipelineError::Validation(format!(
            "{} {} does not take evidence",
            entity_type, to_status
        )));
    }
    Ok(())
}

fn visible_facts(
    conn: &Connection,
    actor: &Actor,
    entity: &EntityRef,
) -> Result<EntityFacts, PipelineError> {
    let not_found = || PipelineError::NotFound(entity.to_string());
    match entity.entity_type {
        EntityType::Lead => {
            let scope = resolve_lead_scope(actor, conn)?;
            let lead = leads::get_lead(conn, &entity.entity_id, &scope)?.ok_or_else(not_found)?;
            Ok(EntityFacts {
                lead_id: lead.id,
                tenant_id: lead.tenant_id,
                from_status: lead.status.to_string(),
            })
        }
        EntityType::Appointment => {
            let scope = resolve_scope(actor, ScopedTable::Appointments, conn)?;
            let appt = appointments::get_appointment(conn, &entity.entity_id, &scope)?
                .ok_or_else(not_found)?;
            Ok(EntityFacts {
                lead_id: appt.lead_id,
                tenant_id: appt.tenant_id,
                from_status: appt.status.to_string(),
            })
        }
        EntityType::Closing => {
            let scope = resolve_scope(actor, ScopedTable::Closings, conn)?;
            let closing =
                closings::get_closing(conn, &entity.entity_id, &scope)?.ok_or_else(not_found)?;
            Ok(EntityFacts {
                lead_id: closing.lead_id,
                tenant_id: closing.tenant_id,
                from_status: closing.approval.to_string(),
            })
        }
    }
}

impl EvidenceService {
    pub fn new(
        db: Arc<PipelineDb>,
        blobs: Arc<dyn BlobStore>,
        events: Arc<EventBus>,
        policy: UploadPolicy,
    ) -> Self {
        Self { db, blobs, events, policy }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Store a proof file and record it against `(entity, from, to)`.
    ///
    /// The returned id is what a later transition cites as its evidence.
    pub async fn upload_evidence(
        &self,
        actor: &Actor,
        upload: EvidenceUpload,
    ) -> Result<EvidenceRow, PipelineError> {
        self.policy
            .check(UploadKind::Evidence, &upload.content_type, upload.bytes.len() as u64)?;
        gated_target(upload.entity.entity_type, &upload.to_status)?;
        actor.require_status_change()?;

        // Scope check before any bytes are stored
        let facts = self.db.with_conn(|conn| visible_facts(conn, actor, &upload.entity))?;

        let key = compute_key(&upload.bytes);
        let url = self.blobs.put(&key, &upload.bytes, &upload.content_type).await?;

        let row = self.db.transaction(|tx| {
            let facts = visible_facts(tx, actor, &upload.entity)?;
            let row = evidence::insert_evidence(
                tx,
                &NewEvidence {
                    lead_id: facts.lead_id.clone(),
                    tenant_id: facts.tenant_id.clone(),
                    entity_type: upload.entity.entity_type,
                    entity_id: upload.entity.entity_id.clone(),
                    from_status: Some(facts.from_status.clone()),
                    to_status: upload.to_status.clone(),
                    blob_key: key.clone(),
                    blob_url: url.clone(),
                    content_type: upload.content_type.trim().to_ascii_lowercase(),
                    size_bytes: upload.bytes.len() as u64,
                    file_name: upload.file_name.clone(),
                    uploaded_by: actor.self_id().to_string(),
                },
            )?;

            // Logged against the lead, not the gated entity, so it never marks
            // the evidence itself as consumed
            let entry = AuditEntry::new(
                MovementKind::EvidenceUploaded,
                EntityRef::lead(facts.lead_id.clone()),
                format!(
                    "Evidence for {} {} -> {}",
                    upload.entity, facts.from_status, upload.to_status
                ),
            )
            .tenant(facts.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);

            Ok(row)
        })?;

        info!(
            evidence = %row.id,
            entity = %upload.entity,
            to = %upload.to_status,
            size = row.size_bytes,
            "Evidence uploaded"
        );

        self.events.emit(PipelineEvent::EvidenceUploaded {
            tenant_id: facts.tenant_id,
            evidence_id: row.id.clone(),
            entity: upload.entity,
        });

        Ok(row)
    }

    /// Attach a signed contract document to a closing
    pub async fn attach_closing_contract(
        &self,
        actor: &Actor,
        closing_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ClosingRow, PipelineError> {
        self.policy.check(UploadKind::Document, content_type, bytes.len() as u64)?;
        if !actor.can_review_closings() {
            return Err(PipelineError::Authorization(format!(
                "{} may not attach contracts",
                actor.role()
            )));
        }

        let entity = EntityRef::closing(closing_id);
        self.db.with_conn(|conn| visible_facts(conn, actor, &entity))?;

        let key = compute_key(bytes);
        self.blobs.put(&key, bytes, content_type).await?;

        self.db.transaction(|tx| {
            let facts = visible_facts(tx, actor, &entity)?;
            closings::set_contract_key(tx, closing_id, &key)?;

            let description = format!("Contract attached ({})", key);
            let entry = AuditEntry::new(MovementKind::ClosingUpdated, entity.clone(), description)
                .tenant(facts.tenant_id);
            audit::record_best_effort(tx, actor, &entry);

            closings::get_closing(tx, closing_id, &Predicate::All)?
                .ok_or_else(|| PipelineError::Internal(format!("Closing {} vanished", closing_id)))
        })
    }

    /// Evidence recorded for a visible entity, oldest first
    pub fn list_evidence(
        &self,
        actor: &Actor,
        entity: &EntityRef,
    ) -> Result<Vec<EvidenceRow>, PipelineError> {
        self.db.with_conn(|conn| {
            visible_facts(conn, actor, entity)?;
            let scope = resolve_scope(actor, ScopedTable::Evidence, conn)?;
            evidence::list_for_entity(conn, &scope, entity.entity_type, &entity.entity_id)
        })
    }

    /// Read back the bytes of a visible evidence row
    pub async fn download_evidence(
        &self,
        actor: &Actor,
        evidence_id: &str,
    ) -> Result<Vec<u8>, PipelineError> {
        let row = self.db.with_conn(|conn| {
            let row = evidence::get_evidence(conn, evidence_id)?
                .ok_or_else(|| PipelineError::NotFound(format!("Evidence {}", evidence_id)))?;
            let lead_scope = resolve_lead_scope(actor, conn)?;
            if leads::get_lead(conn, &row.lead_id, &lead_scope)?.is_none() {
                return Err(PipelineError::NotFound(format!("Evidence {}", evidence_id)));
            }
            Ok(row)
        })?;

        Ok(self.blobs.get(&row.blob_key).await?)
    }
}
