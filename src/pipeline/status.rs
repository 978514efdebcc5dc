//! Status vocabularies for leads, appointments and closings
//!
//! Each vocabulary is a closed enum stored as TEXT. The legal edges live next
//! to the enum so the state machine stays a lookup, not a decision tree.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

use super::EntityType;

/// Behaviour shared by every status vocabulary
pub trait PipelineState: Copy + Eq + fmt::Display + 'static {
    const ENTITY: EntityType;

    fn as_str(&self) -> &'static str;

    /// Statuses reachable in one step
    fn targets(&self) -> &'static [Self];

    /// Negative outcomes that must be justified by uploaded evidence
    fn requires_evidence(&self) -> bool;

    fn can_transition_to(&self, target: Self) -> bool {
        self.targets().contains(&target)
    }

    fn is_terminal(&self) -> bool {
        self.targets().is_empty()
    }
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(PipelineError::Validation(format!(
                        "Unrecognized {} status: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: PipelineError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

// ============================================================================
// Lead
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Lead,
    /// Active state for leads that arrive with a referring consultant
    Patient,
    InConversation,
    TaxIdApproved,
    TaxIdRejected,
    Scheduled,
    Rescheduled,
    Attended,
    Closed,
    NoShow,
    DidNotClose,
    RejectedNotFound,
    RejectedNoInterest,
    RejectedUnrecognized,
    RejectedNoResponse,
    RejectedNoClinic,
    RejectedTaxIdMissing,
    RejectedTaxIdAlternateMissing,
}

text_enum!(LeadStatus {
    Lead => "lead",
    Patient => "patient",
    InConversation => "in_conversation",
    TaxIdApproved => "tax_id_approved",
    TaxIdRejected => "tax_id_rejected",
    Scheduled => "scheduled",
    Rescheduled => "rescheduled",
    Attended => "attended",
    Closed => "closed",
    NoShow => "no_show",
    DidNotClose => "did_not_close",
    RejectedNotFound => "rejected_not_found",
    RejectedNoInterest => "rejected_no_interest",
    RejectedUnrecognized => "rejected_unrecognized",
    RejectedNoResponse => "rejected_no_response",
    RejectedNoClinic => "rejected_no_clinic",
    RejectedTaxIdMissing => "rejected_tax_id_missing",
    RejectedTaxIdAlternateMissing => "rejected_tax_id_alternate_missing",
});

use LeadStatus as L;

const FROM_LEAD: &[LeadStatus] = &[
    L::InConversation,
    L::RejectedNotFound,
    L::RejectedNoInterest,
    L::RejectedUnrecognized,
    L::RejectedNoResponse,
    L::RejectedNoClinic,
    L::RejectedTaxIdMissing,
    L::RejectedTaxIdAlternateMissing,
    L::TaxIdRejected,
];

const FROM_CONVERSATION: &[LeadStatus] = &[
    L::TaxIdApproved,
    L::TaxIdRejected,
    L::Scheduled,
    L::RejectedNotFound,
    L::RejectedNoInterest,
    L::RejectedUnrecognized,
    L::RejectedNoResponse,
    L::RejectedNoClinic,
    L::RejectedTaxIdMissing,
    L::RejectedTaxIdAlternateMissing,
];

const FROM_TAX_ID_APPROVED: &[LeadStatus] = &[
    L::Scheduled,
    L::RejectedNotFound,
    L::RejectedNoInterest,
    L::RejectedUnrecognized,
    L::RejectedNoResponse,
    L::RejectedNoClinic,
    L::RejectedTaxIdMissing,
    L::RejectedTaxIdAlternateMissing,
];

const FROM_SCHEDULED: &[LeadStatus] = &[L::Attended, L::NoShow, L::DidNotClose, L::Rescheduled];

const FROM_RESCHEDULED: &[LeadStatus] = &[L::Scheduled, L::Attended, L::NoShow, L::DidNotClose];

const FROM_ATTENDED: &[LeadStatus] = &[L::Closed, L::DidNotClose];

impl LeadStatus {
    /// Creation-time branch: a referred lead skips the unclaimed queue
    pub fn initial(has_referring_consultant: bool) -> Self {
        if has_referring_consultant {
            L::Patient
        } else {
            L::Lead
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            L::TaxIdRejected
                | L::RejectedNotFound
                | L::RejectedNoInterest
                | L::RejectedUnrecognized
                | L::RejectedNoResponse
                | L::RejectedNoClinic
                | L::RejectedTaxIdMissing
                | L::RejectedTaxIdAlternateMissing
        )
    }
}

impl PipelineState for LeadStatus {
    const ENTITY: EntityType = EntityType::Lead;

    fn as_str(&self) -> &'static str {
        LeadStatus::as_str(self)
    }

    fn targets(&self) -> &'static [Self] {
        match self {
            L::Lead => FROM_LEAD,
            L::Patient | L::InConversation => FROM_CONVERSATION,
            L::TaxIdApproved => FROM_TAX_ID_APPROVED,
            L::Scheduled => FROM_SCHEDULED,
            L::Rescheduled => FROM_RESCHEDULED,
            L::Attended => FROM_ATTENDED,
            _ => &[],
        }
    }

    fn requires_evidence(&self) -> bool {
        self.is_rejection() || matches!(self, L::NoShow | L::DidNotClose)
    }
}

// ============================================================================
// Appointment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Rescheduled,
    Attended,
    NoShow,
    DidNotClose,
    Closed,
}

text_enum!(AppointmentStatus {
    Scheduled => "scheduled",
    Rescheduled => "rescheduled",
    Attended => "attended",
    NoShow => "no_show",
    DidNotClose => "did_not_close",
    Closed => "closed",
});

use AppointmentStatus as A;

const APPT_FROM_SCHEDULED: &[AppointmentStatus] =
    &[A::Attended, A::Rescheduled, A::NoShow, A::DidNotClose, A::Closed];

const APPT_FROM_RESCHEDULED: &[AppointmentStatus] =
    &[A::Scheduled, A::Attended, A::NoShow, A::DidNotClose, A::Closed];

const APPT_FROM_ATTENDED: &[AppointmentStatus] = &[A::Closed, A::DidNotClose];

impl AppointmentStatus {
    /// The lead status an appointment outcome projects back onto
    pub fn lead_status(&self) -> LeadStatus {
        match self {
            A::Scheduled => L::Scheduled,
            A::Rescheduled => L::Rescheduled,
            A::Attended => L::Attended,
            A::NoShow => L::NoShow,
            A::DidNotClose => L::DidNotClose,
            A::Closed => L::Closed,
        }
    }

    /// The appointment status a lead status projects onto, if any
    pub fn mirror_of(lead: LeadStatus) -> Option<Self> {
        match lead {
            L::Scheduled => Some(A::Scheduled),
            L::Rescheduled => Some(A::Rescheduled),
            L::Attended => Some(A::Attended),
            L::NoShow => Some(A::NoShow),
            L::DidNotClose => Some(A::DidNotClose),
            L::Closed => Some(A::Closed),
            _ => None,
        }
    }
}

impl PipelineState for AppointmentStatus {
    const ENTITY: EntityType = EntityType::Appointment;

    fn as_str(&self) -> &'static str {
        AppointmentStatus::as_str(self)
    }

    fn targets(&self) -> &'static [Self] {
        match self {
            A::Scheduled => APPT_FROM_SCHEDULED,
            A::Rescheduled => APPT_FROM_RESCHEDULED,
            A::Attended => APPT_FROM_ATTENDED,
            A::NoShow | A::DidNotClose | A::Closed => &[],
        }
    }

    fn requires_evidence(&self) -> bool {
        matches!(self, A::NoShow | A::DidNotClose)
    }
}

// ============================================================================
// Closing approval
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingApproval {
    Pending,
    Approved,
    Rejected,
}

text_enum!(ClosingApproval {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

impl PipelineState for ClosingApproval {
    const ENTITY: EntityType = EntityType::Closing;

    fn as_str(&self) -> &'static str {
        ClosingApproval::as_str(self)
    }

    fn targets(&self) -> &'static [Self] {
        match self {
            ClosingApproval::Pending => &[ClosingApproval::Approved, ClosingApproval::Rejected],
            ClosingApproval::Approved => &[ClosingApproval::Rejected],
            ClosingApproval::Rejected => &[ClosingApproval::Approved],
        }
    }

    fn requires_evidence(&self) -> bool {
        *self == ClosingApproval::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_covers_every_status() {
        for status in LeadStatus::ALL {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), *status);
        }
        for status in AppointmentStatus::ALL {
            assert_eq!(status.as_str().parse::<AppointmentStatus>().unwrap(), *status);
        }
        assert!("paciente".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn test_serde_matches_text() {
        let json = serde_json::to_string(&LeadStatus::RejectedTaxIdAlternateMissing).unwrap();
        assert_eq!(json, "\"rejected_tax_id_alternate_missing\"");
    }

    #[test]
    fn test_negative_outcomes_are_gated_and_terminal() {
        for status in LeadStatus::ALL {
            if status.requires_evidence() {
                assert!(status.is_terminal(), "{} should be terminal", status);
            }
        }
        assert!(LeadStatus::NoShow.requires_evidence());
        assert!(LeadStatus::TaxIdRejected.requires_evidence());
        assert!(!LeadStatus::Closed.requires_evidence());
        assert!(!LeadStatus::TaxIdApproved.requires_evidence());
    }

    #[test]
    fn test_lead_edges() {
        assert!(LeadStatus::Lead.can_transition_to(LeadStatus::InConversation));
        assert!(!LeadStatus::Lead.can_transition_to(LeadStatus::Scheduled));
        assert!(LeadStatus::InConversation.can_transition_to(LeadStatus::RejectedNoResponse));
        assert!(LeadStatus::Patient.can_transition_to(LeadStatus::Scheduled));
        assert!(LeadStatus::Attended.can_transition_to(LeadStatus::Closed));
        assert!(!LeadStatus::Scheduled.can_transition_to(LeadStatus::Closed));
        assert!(LeadStatus::Closed.is_terminal());
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(LeadStatus::initial(false), LeadStatus::Lead);
        assert_eq!(LeadStatus::initial(true), LeadStatus::Patient);
    }

    #[test]
    fn test_appointment_edges_and_mirror() {
        assert!(AppointmentStatus::Scheduled.can_transition_to(AppointmentStatus::Closed));
        assert!(AppointmentStatus::Rescheduled.can_transition_to(AppointmentStatus::Scheduled));
        assert!(AppointmentStatus::Closed.is_terminal());
        assert_eq!(
            AppointmentStatus::mirror_of(LeadStatus::Closed),
            Some(AppointmentStatus::Closed)
        );
        assert_eq!(AppointmentStatus::mirror_of(LeadStatus::InConversation), None);
    }

    #[test]
    fn test_closing_review_edges() {
        assert!(ClosingApproval::Pending.can_transition_to(ClosingApproval::Approved));
        assert!(ClosingApproval::Approved.can_transition_to(ClosingApproval::Rejected));
        assert!(ClosingApproval::Rejected.requires_evidence());
        assert!(!ClosingApproval::Approved.can_transition_to(ClosingApproval::Pending));
    }
}
