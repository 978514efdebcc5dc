//! Public intake (self-registration)
//!
//! Unauthenticated. The new lead is its own actor in the audit log.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::actor::Actor;
use crate::audit::{self, AuditEntry, MovementKind};
use crate::db::leads::{self, normalize_digits, normalize_email, LeadRow, NewLead};
use crate::db::PipelineDb;
use crate::error::PipelineError;
use crate::pipeline::{EntityRef, LeadStatus};

use super::events::{EventBus, PipelineEvent};

/// Self-registration form
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeForm {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tax_id: Option<String>,
    /// Consultant whose referral link was used
    #[serde(default)]
    pub referral_consultant_id: Option<String>,
    #[serde(default)]
    pub clinic_id: Option<String>,
}

impl IntakeForm {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.display_name.trim().is_empty() {
            return Err(PipelineError::Validation("displayName is required".into()));
        }
        let phone = self.phone.as_deref().and_then(normalize_digits);
        let email = self.email.as_deref().and_then(normalize_email);
        if phone.is_none() && email.is_none() {
            return Err(PipelineError::Validation("A phone number or email is required".into()));
        }
        if let Some(ref email) = email {
            if !email.contains('@') {
                return Err(PipelineError::Validation(format!("Invalid email: {}", email)));
            }
        }
        Ok(())
    }

    fn into_new_lead(self) -> NewLead {
        let blank_to_none =
            |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        NewLead {
            tenant_id: blank_to_none(self.tenant_id),
            display_name: self.display_name,
            phone: self.phone,
            email: self.email,
            tax_id: self.tax_id,
            assigned_consultant_id: blank_to_none(self.referral_consultant_id),
            clinic_id: blank_to_none(self.clinic_id),
        }
    }
}

pub struct IntakeService {
    db: Arc<PipelineDb>,
    events: Arc<EventBus>,
}

impl IntakeService {
    pub fn new(db: Arc<PipelineDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Register a lead. Duplicate contacts within the tenant are a `Conflict`.
    pub fn submit(&self, form: IntakeForm) -> Result<LeadRow, PipelineError> {
        form.validate()?;
        let input = form.into_new_lead();
        let status = LeadStatus::initial(input.assigned_consultant_id.is_some());

        let lead = self.db.transaction(|tx| {
            let lead = leads::insert_unique(tx, &input, status)?;

            let actor = Actor::patient(lead.id.clone());
            let entry = AuditEntry::new(
                MovementKind::LeadCreated,
                EntityRef::lead(lead.id.clone()),
                format!("Self-registered at {}", lead.status),
            )
            .related(lead.related_consultant_ids())
            .tenant(lead.tenant_id.clone());
            audit::record_best_effort(tx, &actor, &entry);

            Ok(lead)
        })?;

        info!(
            lead = %lead.id,
            tenant = ?lead.tenant_id,
            status = %lead.status,
            "Intake lead registered"
        );

        self.events.emit(PipelineEvent::LeadCreated {
            tenant_id: lead.tenant_id.clone(),
            lead_id: lead.id.clone(),
            status: lead.status.to_string(),
        });

        Ok(lead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> IntakeService {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        IntakeService::new(db, Arc::new(EventBus::new()))
    }

    fn form(email: &str) -> IntakeForm {
        IntakeForm {
            tenant_id: Some("t1".into()),
            display_name: "Ana".into(),
            email: Some(email.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_without_referral_starts_as_lead() {
        let lead = service().submit(form("ana@example.com")).unwrap();
        assert_eq!(lead.status, LeadStatus::Lead);
        assert!(lead.assigned_sdr_id.is_none());
    }

    #[test]
    fn test_referral_starts_as_patient() {
        let lead = service()
            .submit(IntakeForm {
                referral_consultant_id: Some("c-1".into()),
                ..form("ana@example.com")
            })
            .unwrap();
        assert_eq!(lead.status, LeadStatus::Patient);
        assert_eq!(lead.assigned_consultant_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_contact_required() {
        let err = service()
            .submit(IntakeForm { display_name: "Ana".into(), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let svc = service();
        svc.submit(form("ana@example.com")).unwrap();
        let err = svc.submit(form(" ANA@example.com ")).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[test]
    fn test_duplicate_phone_formats_conflict() {
        let svc = service();
        svc.submit(IntakeForm {
            phone: Some("+55 (11) 98888-7777".into()),
            ..form("a@example.com")
        })
        .unwrap();
        let err = svc
            .submit(IntakeForm {
                phone: Some("5511988887777".into()),
                ..form("b@example.com")
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }
}
