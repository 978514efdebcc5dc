//! Pipeline service - guarded mutations and scoped reads
//!
//! Every mutation runs the same sequence inside one unit of work:
//! capability gate, scope (out-of-scope rows are `NotFound`), state machine,
//! evidence gate, primary compare-and-set write, cascade, best-effort audit.
//! Events are emitted only after commit.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::actor::{Actor, Role};
use crate::audit::{self, AuditEntry, MovementKind};
use crate::cascade::{self, AppliedTransition, CascadeEffect, CascadeSnapshot, ScheduleDetails};
use crate::claim;
use crate::db::appointments::{self, AppointmentRow};
use crate::db::closings::{self, ClosingRow};
use crate::db::leads::{self, DeletedLead, LeadQuery, LeadRow, NewLead};
use crate::db::movements::{self, MovementRow};
use crate::db::PipelineDb;
use crate::error::PipelineError;
use crate::evidence::check_gate;
use crate::pipeline::{
    plan_transition, AppointmentStatus, ClosingApproval, EntityRef, EntityType, LeadStatus,
    TransitionPlan,
};
use crate::scope::{resolve_lead_scope, resolve_scope, Predicate, ScopedTable};

use super::events::{EventBus, PipelineEvent};

/// Requested lead status change
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub lead_id: String,
    pub target: LeadStatus,
    #[serde(default)]
    pub evidence_id: Option<String>,
    /// Visit details for `scheduled` and `rescheduled`
    #[serde(default)]
    pub schedule: Option<ScheduleDetails>,
}

impl TransitionRequest {
    pub fn new(lead_id: impl Into<String>, target: LeadStatus) -> Self {
        Self {
            lead_id: lead_id.into(),
            target,
            evidence_id: None,
            schedule: None,
        }
    }

    pub fn with_evidence(mut self, evidence_id: impl Into<String>) -> Self {
        self.evidence_id = Some(evidence_id.into());
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleDetails) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

/// Result of a transition request
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome<T> {
    /// Row after the unit of work committed
    pub record: T,
    /// `false` when the requested status was already current
    pub applied: bool,
    /// Status before the write, when one was applied
    pub previous: Option<String>,
    #[serde(skip)]
    pub effects: Vec<CascadeEffect>,
}

impl<T> TransitionOutcome<T> {
    fn unchanged(record: T) -> Self {
        Self { record, applied: false, previous: None, effects: Vec::new() }
    }

    fn applied(record: T, previous: impl ToString, effects: Vec<CascadeEffect>) -> Self {
        Self { record, applied: true, previous: Some(previous.to_string()), effects }
    }
}

/// Pipeline service
pub struct PipelineService {
    db: Arc<PipelineDb>,
    events: Arc<EventBus>,
}

fn lead_scope(conn: &Connection, actor: &Actor) -> Result<Predicate, PipelineError> {
    resolve_lead_scope(actor, conn)
}

fn table_scope(
    conn: &Connection,
    actor: &Actor,
    table: ScopedTable,
) -> Result<Predicate, PipelineError> {
    resolve_scope(actor, table, conn)
}

/// Fetch a lead the actor can see; anything else is `NotFound`
fn visible_lead(conn: &Connection, actor: &Actor, lead_id: &str) -> Result<LeadRow, PipelineError> {
    let scope = lead_scope(conn, actor)?;
    leads::get_lead(conn, lead_id, &scope)?
        .ok_or_else(|| PipelineError::NotFound(format!("Lead {}", lead_id)))
}

fn validate_schedule(schedule: &ScheduleDetails) -> Result<(), PipelineError> {
    if let Some(ref when) = schedule.scheduled_for {
        let valid = chrono::DateTime::parse_from_rfc3339(when).is_ok()
            || chrono::NaiveDate::parse_from_str(when, "%Y-%m-%d").is_ok();
        if !valid {
            return Err(PipelineError::Validation(format!("Invalid scheduledFor: {}", when)));
        }
    }
    Ok(())
}

fn record_effects(
    tx: &mut rusqlite::Transaction<'_>,
    actor: &Actor,
    lead: &LeadRow,
    effects: &[CascadeEffect],
) {
    for effect in effects {
        let entry = AuditEntry::new(effect.kind, effect.entity.clone(), effect.description.clone())
            .related(lead.related_consultant_ids())
            .tenant(lead.tenant_id.clone());
        audit::record_best_effort(tx, actor, &entry);
    }
}

impl PipelineService {
    pub fn new(db: Arc<PipelineDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get_lead(&self, actor: &Actor, lead_id: &str) -> Result<LeadRow, PipelineError> {
        self.db.with_conn(|conn| visible_lead(conn, actor, lead_id))
    }

    pub fn list_leads(
        &self,
        actor: &Actor,
        query: &LeadQuery,
    ) -> Result<Vec<LeadRow>, PipelineError> {
        self.db.with_conn(|conn| {
            let scope = lead_scope(conn, actor)?;
            leads::list_leads(conn, &scope, query)
        })
    }

    pub fn list_appointments(
        &self,
        actor: &Actor,
        lead_id: Option<&str>,
    ) -> Result<Vec<AppointmentRow>, PipelineError> {
        self.db.with_conn(|conn| {
            let scope = table_scope(conn, actor, ScopedTable::Appointments)?;
            appointments::list_appointments(conn, &scope, lead_id)
        })
    }

    pub fn list_closings(
        &self,
        actor: &Actor,
        approval: Option<ClosingApproval>,
    ) -> Result<Vec<ClosingRow>, PipelineError> {
        self.db.with_conn(|conn| {
            let scope = table_scope(conn, actor, ScopedTable::Closings)?;
            closings::list_closings(conn, &scope, approval)
        })
    }

    /// Movement history of a visible lead, oldest first
    pub fn history(&self, actor: &Actor, lead_id: &str) -> Result<Vec<MovementRow>, PipelineError> {
        self.db.with_conn(|conn| {
            visible_lead(conn, actor, lead_id)?;
            movements::list_for_lead(conn, lead_id)
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Staff-side lead creation.
    ///
    /// Tenant-scoped actors always create inside their own tenant. A
    /// freelancer is always the referring consultant of leads they create; a
    /// clinic's leads carry its clinic id.
    pub fn create_lead(&self, actor: &Actor, mut input: NewLead) -> Result<LeadRow, PipelineError> {
        if !actor.can_create_leads() {
            return Err(PipelineError::Authorization(format!(
                "{} may not create leads",
                actor.role()
            )));
        }

        if let Some(tenant) = actor.tenant_id() {
            input.tenant_id = Some(tenant.to_string());
        }
        match actor.role() {
            Role::FreelanceConsultant { .. } => {
                input.assigned_consultant_id = Some(actor.self_id().to_string());
            }
            Role::Clinic => {
                input.clinic_id = actor.clinic_id().map(String::from);
            }
            _ => {}
        }

        let status = LeadStatus::initial(input.assigned_consultant_id.is_some());

        let lead = self.db.transaction(|tx| {
            let lead = leads::insert_unique(tx, &input, status)?;
            let entry = AuditEntry::new(
                MovementKind::LeadCreated,
                EntityRef::lead(lead.id.clone()),
                format!("Lead created by {} at {}", actor, lead.status),
            )
            .related(lead.related_consultant_ids())
            .tenant(lead.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);
            Ok(lead)
        })?;

        info!(lead = %lead.id, actor = %actor, status = %lead.status, "Lead created");

        self.events.emit(PipelineEvent::LeadCreated {
            tenant_id: lead.tenant_id.clone(),
            lead_id: lead.id.clone(),
            status: lead.status.to_string(),
        });

        Ok(lead)
    }

    /// Claim an unassigned lead for the acting SDR
    pub fn claim(&self, actor: &Actor, lead_id: &str) -> Result<LeadRow, PipelineError> {
        actor.require_status_change()?;

        let outcome = self.db.transaction(|tx| {
            visible_lead(tx, actor, lead_id)?;
            let outcome = claim::claim(tx, lead_id, actor.self_id())?;

            let mut description = format!("Claimed by {}", actor.self_id());
            if outcome.status_changed() {
                description.push_str(&format!(
                    "; {} -> {}",
                    outcome.previous_status, outcome.lead.status
                ));
            }
            let entry =
                AuditEntry::new(MovementKind::LeadClaimed, EntityRef::lead(lead_id), description)
                .related(outcome.lead.related_consultant_ids())
                .tenant(outcome.lead.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);

            Ok(outcome)
        })?;

        self.events.emit(PipelineEvent::LeadClaimed {
            tenant_id: outcome.lead.tenant_id.clone(),
            lead_id: lead_id.to_string(),
            claimant_id: actor.self_id().to_string(),
        });
        if outcome.status_changed() {
            self.events.emit(PipelineEvent::StatusChanged {
                tenant_id: outcome.lead.tenant_id.clone(),
                entity: EntityRef::lead(lead_id),
                from: outcome.previous_status.to_string(),
                to: outcome.lead.status.to_string(),
                actor_id: actor.self_id().to_string(),
            });
        }

        Ok(outcome.lead)
    }

    /// Move a lead to `request.target`, cascading onto its appointment and
    /// closing
    pub fn transition_lead(
        &self,
        actor: &Actor,
        request: &TransitionRequest,
    ) -> Result<TransitionOutcome<LeadRow>, PipelineError> {
        if let Some(ref schedule) = request.schedule {
            validate_schedule(schedule)?;
        }
        actor.require_status_change()?;

        let entity = EntityRef::lead(request.lead_id.clone());

        let outcome = self.db.transaction(|tx| {
            let lead = visible_lead(tx, actor, &request.lead_id)?;

            let (from, to) = match plan_transition(lead.status, request.target)? {
                TransitionPlan::NoOp => {
                    return Ok(TransitionOutcome::unchanged(lead));
                }
                TransitionPlan::Apply { from, to } => (from, to),
            };

            let gate = check_gate(tx, &entity, to, request.evidence_id.as_deref())?;

            let snapshot = CascadeSnapshot::load(tx, lead)?;
            if leads::update_status_if(tx, &request.lead_id, from, to)? == 0 {
                return Err(PipelineError::Conflict(format!(
                    "Lead {} is no longer {}",
                    request.lead_id, from
                )));
            }

            let applied = AppliedTransition::Lead { from, to, schedule: request.schedule.clone() };
            let writes = cascade::apply_cascade(&applied, &snapshot);
            let effects = cascade::execute(tx, &writes)?;

            let description = format!("{} -> {}", from, to);
            let entry = AuditEntry::new(MovementKind::StatusChanged, entity.clone(), description)
                .related(snapshot.lead.related_consultant_ids())
                .tenant(snapshot.lead.tenant_id.clone())
                .evidence(gate.evidence_id().map(String::from));
            audit::record_best_effort(tx, actor, &entry);
            record_effects(tx, actor, &snapshot.lead, &effects);

            let record = leads::get_lead(tx, &request.lead_id, &Predicate::All)?
                .ok_or_else(|| {
                    PipelineError::Internal(format!("Lead {} vanished", request.lead_id))
                })?;
            Ok(TransitionOutcome::applied(record, from, effects))
        })?;

        if outcome.applied {
            info!(
                lead = %request.lead_id,
                actor = %actor,
                to = %request.target,
                cascaded = outcome.effects.len(),
                "Lead transition applied"
            );
            self.emit_transition(
                actor,
                &entity,
                &outcome,
                request.target.as_str(),
                outcome.record.tenant_id.clone(),
                &request.lead_id,
            );
        }

        Ok(outcome)
    }

    /// Move an appointment; closing an appointment closes its lead
    pub fn transition_appointment(
        &self,
        actor: &Actor,
        appointment_id: &str,
        target: AppointmentStatus,
        evidence_id: Option<&str>,
    ) -> Result<TransitionOutcome<AppointmentRow>, PipelineError> {
        actor.require_status_change()?;

        let entity = EntityRef::appointment(appointment_id);

        let outcome = self.db.transaction(|tx| {
            let scope = table_scope(tx, actor, ScopedTable::Appointments)?;
            let appointment = appointments::get_appointment(tx, appointment_id, &scope)?
                .ok_or_else(|| PipelineError::NotFound(format!("Appointment {}", appointment_id)))?;

            let (from, to) = match plan_transition(appointment.status, target)? {
                TransitionPlan::NoOp => {
                    return Ok(TransitionOutcome::unchanged(appointment));
                }
                TransitionPlan::Apply { from, to } => (from, to),
            };

            let gate = check_gate(tx, &entity, to, evidence_id)?;

            let lead = leads::get_lead(tx, &appointment.lead_id, &Predicate::All)?
                .ok_or_else(|| PipelineError::NotFound(format!("Lead {}", appointment.lead_id)))?;
            let snapshot = CascadeSnapshot::load(tx, lead)?;

            if appointments::update_status_if(tx, appointment_id, from, to)? == 0 {
                return Err(PipelineError::Conflict(format!(
                    "Appointment {} is no longer {}",
                    appointment_id, from
                )));
            }

            let applied = AppliedTransition::Appointment {
                appointment_id: appointment_id.to_string(),
                from,
                to,
            };
            let writes = cascade::apply_cascade(&applied, &snapshot);
            let effects = cascade::execute(tx, &writes)?;

            let entry = AuditEntry::new(
                MovementKind::AppointmentStatusChanged,
                entity.clone(),
                format!("{} -> {}", from, to),
            )
            .related(snapshot.lead.related_consultant_ids())
            .tenant(snapshot.lead.tenant_id.clone())
            .evidence(gate.evidence_id().map(String::from));
            audit::record_best_effort(tx, actor, &entry);
            record_effects(tx, actor, &snapshot.lead, &effects);

            let record = appointments::get_appointment(tx, appointment_id, &Predicate::All)?
                .ok_or_else(|| {
                    PipelineError::Internal(format!("Appointment {} vanished", appointment_id))
                })?;
            Ok(TransitionOutcome::applied(record, from, effects))
        })?;

        if outcome.applied {
            info!(
                appointment = %appointment_id,
                actor = %actor,
                to = %target,
                "Appointment transition applied"
            );
            self.emit_transition(
                actor,
                &entity,
                &outcome,
                target.as_str(),
                outcome.record.tenant_id.clone(),
                &outcome.record.lead_id,
            );
        }

        Ok(outcome)
    }

    /// Approve or reject a closing. Rejection needs evidence.
    pub fn review_closing(
        &self,
        actor: &Actor,
        closing_id: &str,
        approval: ClosingApproval,
        evidence_id: Option<&str>,
    ) -> Result<TransitionOutcome<ClosingRow>, PipelineError> {
        if !actor.can_review_closings() {
            return Err(PipelineError::Authorization(format!(
                "{} may not review closings",
                actor.role()
            )));
        }

        let entity = EntityRef::closing(closing_id);

        let outcome = self.db.transaction(|tx| {
            let closing = self.visible_closing(tx, actor, closing_id)?;

            let (from, to) = match plan_transition(closing.approval, approval)? {
                TransitionPlan::NoOp => {
                    return Ok(TransitionOutcome::unchanged(closing));
                }
                TransitionPlan::Apply { from, to } => (from, to),
            };

            let gate = check_gate(tx, &entity, to, evidence_id)?;

            if closings::set_approval_if(tx, closing_id, from, to)? == 0 {
                return Err(PipelineError::Conflict(format!(
                    "Closing {} is no longer {}",
                    closing_id, from
                )));
            }

            let description = format!("{} -> {}", from, to);
            let entry = AuditEntry::new(MovementKind::ClosingReviewed, entity.clone(), description)
                .related(closing.consultant_id.iter().cloned().collect())
                .tenant(closing.tenant_id.clone())
                .evidence(gate.evidence_id().map(String::from));
            audit::record_best_effort(tx, actor, &entry);

            let record = closings::get_closing(tx, closing_id, &Predicate::All)?
                .ok_or_else(|| {
                    PipelineError::Internal(format!("Closing {} vanished", closing_id))
                })?;
            Ok(TransitionOutcome::applied(record, from, Vec::new()))
        })?;

        if outcome.applied {
            info!(closing = %closing_id, actor = %actor, approval = %approval, "Closing reviewed");
            self.emit_transition(
                actor,
                &entity,
                &outcome,
                approval.as_str(),
                outcome.record.tenant_id.clone(),
                &outcome.record.lead_id,
            );
        }

        Ok(outcome)
    }

    /// Set the negotiated value and payment method of a closing
    pub fn update_closing_terms(
        &self,
        actor: &Actor,
        closing_id: &str,
        value_cents: i64,
        payment_method: &str,
    ) -> Result<ClosingRow, PipelineError> {
        if !actor.can_review_closings() {
            return Err(PipelineError::Authorization(format!(
                "{} may not edit closings",
                actor.role()
            )));
        }

        self.db.transaction(|tx| {
            let closing = self.visible_closing(tx, actor, closing_id)?;
            closings::update_terms(tx, closing_id, value_cents, payment_method)?;

            let entry = AuditEntry::new(
                MovementKind::ClosingUpdated,
                EntityRef::closing(closing_id),
                format!(
                    "Terms {} / {} -> {} / {}",
                    closing.value_cents,
                    closing.payment_method,
                    value_cents,
                    payment_method.trim()
                ),
            )
            .related(closing.consultant_id.iter().cloned().collect())
            .tenant(closing.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);

            closings::get_closing(tx, closing_id, &Predicate::All)?
                .ok_or_else(|| PipelineError::Internal(format!("Closing {} vanished", closing_id)))
        })
    }

    /// Route a lead to the internal consultant who will service it
    pub fn assign_internal_consultant(
        &self,
        actor: &Actor,
        lead_id: &str,
        consultant_id: &str,
    ) -> Result<LeadRow, PipelineError> {
        let consultant_id = consultant_id.trim();
        if consultant_id.is_empty() {
            return Err(PipelineError::Validation("consultantId is required".into()));
        }
        if !actor.can_assign_internal_consultants() {
            return Err(PipelineError::Authorization(format!(
                "{} may not assign internal consultants",
                actor.role()
            )));
        }

        self.db.transaction(|tx| {
            let before = visible_lead(tx, actor, lead_id)?;
            leads::set_internal_consultant(tx, lead_id, consultant_id)?;
            let lead = leads::get_lead(tx, lead_id, &Predicate::All)?
                .ok_or_else(|| PipelineError::Internal(format!("Lead {} vanished", lead_id)))?;

            let entry = AuditEntry::new(
                MovementKind::InternalConsultantAssigned,
                EntityRef::lead(lead_id),
                format!(
                    "Internal consultant {} -> {}",
                    before.assigned_internal_consultant_id.as_deref().unwrap_or("none"),
                    consultant_id
                ),
            )
            .related(lead.related_consultant_ids())
            .tenant(lead.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);

            Ok(lead)
        })
    }

    /// Hard-delete a lead with its appointments and closing. Evidence and
    /// movements stay.
    pub fn delete_lead(&self, actor: &Actor, lead_id: &str) -> Result<DeletedLead, PipelineError> {
        if !actor.can_delete_leads() {
            return Err(PipelineError::Authorization(format!(
                "{} may not delete leads",
                actor.role()
            )));
        }

        let (lead, deleted) = self.db.transaction(|tx| {
            let lead = visible_lead(tx, actor, lead_id)?;
            let deleted = leads::delete_lead(tx, lead_id)?
                .ok_or_else(|| PipelineError::NotFound(format!("Lead {}", lead_id)))?;

            let entry = AuditEntry::new(
                MovementKind::LeadDeleted,
                EntityRef::lead(lead_id),
                format!(
                    "Deleted {} ({} appointments, {} closings)",
                    lead.display_name, deleted.appointments, deleted.closings
                ),
            )
            .related(lead.related_consultant_ids())
            .tenant(lead.tenant_id.clone());
            audit::record_best_effort(tx, actor, &entry);

            Ok((lead, deleted))
        })?;

        info!(lead = %lead_id, actor = %actor, "Lead deleted");

        self.events.emit(PipelineEvent::LeadDeleted {
            tenant_id: lead.tenant_id,
            lead_id: lead_id.to_string(),
        });

        Ok(deleted)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn visible_closing(
        &self,
        conn: &Connection,
        actor: &Actor,
        closing_id: &str,
    ) -> Result<ClosingRow, PipelineError> {
        let scope = table_scope(conn, actor, ScopedTable::Closings)?;
        closings::get_closing(conn, closing_id, &scope)?
            .ok_or_else(|| PipelineError::NotFound(format!("Closing {}", closing_id)))
    }

    fn emit_transition<T>(
        &self,
        actor: &Actor,
        entity: &EntityRef,
        outcome: &TransitionOutcome<T>,
        to: &str,
        tenant_id: Option<String>,
        lead_id: &str,
    ) {
        if let Some(ref from) = outcome.previous {
            self.events.emit(PipelineEvent::StatusChanged {
                tenant_id: tenant_id.clone(),
                entity: entity.clone(),
                from: from.clone(),
                to: to.to_string(),
                actor_id: actor.self_id().to_string(),
            });
        }
        for effect in &outcome.effects {
            if effect.entity.entity_type == EntityType::Closing
                && effect.kind == MovementKind::ClosingCreated
            {
                self.events.emit(PipelineEvent::ClosingCreated {
                    tenant_id: tenant_id.clone(),
                    closing_id: effect.entity.entity_id.clone(),
                    lead_id: lead_id.to_string(),
                });
            }
        }
    }
}
