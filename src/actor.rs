//! Actor model: who is asking
//!
//! The credential layer hands us raw `SessionClaims` (a role string plus two
//! capability flags). They are resolved exactly once into an `Actor` whose
//! `Role` is an explicit variant; nothing downstream looks at the raw flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::PipelineError;

/// Raw claims produced by the session/credential verifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    /// One of: admin, partner, consultant, clinic, patient
    pub role: String,
    pub self_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub clinic_id: Option<String>,
    #[serde(default)]
    pub can_see_all_new_clinics: bool,
    #[serde(default)]
    pub can_change_status: bool,
}

/// Resolved role of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Partner,
    /// Tenant staff: both capability flags set and a tenant present
    InternalConsultant,
    /// External referrer; may or may not hold the status-change capability
    FreelanceConsultant { can_change_status: bool },
    Clinic,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Partner => "partner",
            Role::InternalConsultant => "internal_consultant",
            Role::FreelanceConsultant { .. } => "freelance_consultant",
            Role::Clinic => "clinic",
            Role::Patient => "patient",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-request description of the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    role: Role,
    self_id: String,
    tenant_id: Option<String>,
    clinic_id: Option<String>,
}

impl Actor {
    /// Resolve raw claims into an actor. This is the only place the capability
    /// flags are inspected.
    pub fn from_claims(claims: &SessionClaims) -> Result<Self, PipelineError> {
        let self_id = claims.self_id.trim();
        if self_id.is_empty() {
            return Err(PipelineError::Validation("selfId is required".into()));
        }

        let tenant_id = claims.tenant_id.clone().filter(|t| !t.trim().is_empty());
        let clinic_id = claims.clinic_id.clone().filter(|c| !c.trim().is_empty());

        let role = match claims.role.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "partner" => Role::Partner,
            "consultant" => {
                if claims.can_see_all_new_clinics
                    && claims.can_change_status
                    && tenant_id.is_some()
                {
                    Role::InternalConsultant
                } else {
                    Role::FreelanceConsultant {
                        can_change_status: claims.can_change_status,
                    }
                }
            }
            "clinic" => Role::Clinic,
            "patient" => Role::Patient,
            other => {
                return Err(PipelineError::Validation(format!("Unknown role: {}", other)));
            }
        };

        debug!(role = %role, self_id = %self_id, tenant = ?tenant_id, "Resolved actor from claims");

        Ok(Self {
            role,
            self_id: self_id.to_string(),
            tenant_id,
            clinic_id,
        })
    }

    /// Unscoped system administrator
    pub fn admin(self_id: impl Into<String>) -> Self {
        Self::build(Role::Admin, self_id, None, None)
    }

    /// Administrator narrowed to one tenant
    pub fn tenant_admin(self_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::build(Role::Admin, self_id, Some(tenant_id.into()), None)
    }

    pub fn partner(self_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::build(Role::Partner, self_id, Some(tenant_id.into()), None)
    }

    pub fn internal_consultant(self_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::build(Role::InternalConsultant, self_id, Some(tenant_id.into()), None)
    }

    pub fn freelance_consultant(
        self_id: impl Into<String>,
        tenant_id: Option<String>,
        can_change_status: bool,
    ) -> Self {
        Self::build(
            Role::FreelanceConsultant { can_change_status },
            self_id,
            tenant_id,
            None,
        )
    }

    pub fn clinic(
        self_id: impl Into<String>,
        tenant_id: Option<String>,
        clinic_id: impl Into<String>,
    ) -> Self {
        Self::build(Role::Clinic, self_id, tenant_id, Some(clinic_id.into()))
    }

    /// A lead viewing its own record; `lead_id` is its self id
    pub fn patient(lead_id: impl Into<String>) -> Self {
        Self::build(Role::Patient, lead_id, None, None)
    }

    fn build(
        role: Role,
        self_id: impl Into<String>,
        tenant_id: Option<String>,
        clinic_id: Option<String>,
    ) -> Self {
        Self {
            role,
            self_id: self_id.into(),
            tenant_id,
            clinic_id,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn clinic_id(&self) -> Option<&str> {
        self.clinic_id.as_deref()
    }

    /// May perform status transitions and claims
    pub fn can_change_status(&self) -> bool {
        match self.role {
            Role::Admin | Role::Partner | Role::InternalConsultant => true,
            Role::FreelanceConsultant { can_change_status } => can_change_status,
            Role::Clinic | Role::Patient => false,
        }
    }

    /// Closing approval is an administrative mutation; internal consultants
    /// share tenant visibility but not this right.
    pub fn can_review_closings(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Partner)
    }

    /// Staff who route leads to an internal consultant
    pub fn can_assign_internal_consultants(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Partner | Role::InternalConsultant)
    }

    pub fn can_delete_leads(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_create_leads(&self) -> bool {
        self.role != Role::Patient
    }

    /// Require the status-change capability
    pub fn require_status_change(&self) -> Result<(), PipelineError> {
        if self.can_change_status() {
            Ok(())
        } else {
            Err(PipelineError::Authorization(format!(
                "{} may not change pipeline status",
                self.role
            )))
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.self_id)
    }
}
