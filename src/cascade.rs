//! Cascade effect engine
//!
//! `apply_cascade` maps an applied transition plus a snapshot of the related
//! rows (read in the same unit of work) to a list of derived writes. It does
//! no I/O. `execute` applies the writes through the open transaction; a
//! compare-and-set that matches no row aborts the whole unit of work.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::MovementKind;
use crate::db::appointments::{self, AppointmentRow, NewAppointment};
use crate::db::closings::{self, NewClosing};
use crate::db::leads::{self, LeadRow};
use crate::error::PipelineError;
use crate::pipeline::{AppointmentStatus, EntityRef, LeadStatus, PipelineState};

/// Where and when a visit happens, supplied with `scheduled`/`rescheduled`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDetails {
    #[serde(default)]
    pub clinic_id: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<String>,
}

/// A primary status write that has just been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedTransition {
    Lead {
        from: LeadStatus,
        to: LeadStatus,
        schedule: Option<ScheduleDetails>,
    },
    Appointment {
        appointment_id: String,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
}

/// Related rows as they stood before the primary write
#[derive(Debug, Clone)]
pub struct CascadeSnapshot {
    pub lead: LeadRow,
    pub latest_appointment: Option<AppointmentRow>,
    pub closing_exists: bool,
}

impl CascadeSnapshot {
    /// Read the snapshot for `lead`
    pub fn load(conn: &Connection, lead: LeadRow) -> Result<Self, PipelineError> {
        let latest_appointment = appointments::latest_for_lead(conn, &lead.id)?;
        let closing_exists = closings::exists_for_lead(conn, &lead.id)?;
        Ok(Self {
            lead,
            latest_appointment,
            closing_exists,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedWrite {
    SetAppointmentStatus {
        appointment_id: String,
        expected: AppointmentStatus,
        status: AppointmentStatus,
    },
    CreateAppointment(NewAppointment),
    RescheduleAppointment {
        appointment_id: String,
        scheduled_for: String,
    },
    SetLeadStatus {
        lead_id: String,
        expected: LeadStatus,
        status: LeadStatus,
    },
    EnsureClosing(NewClosing),
}

/// Compute the derived writes for `transition`
pub fn apply_cascade(
    transition: &AppliedTransition,
    snapshot: &CascadeSnapshot,
) -> Vec<DerivedWrite> {
    let lead = &snapshot.lead;
    let latest = snapshot.latest_appointment.as_ref();
    let mut writes = Vec::new();

    match transition {
        AppliedTransition::Lead { from, to, schedule } => match to {
            LeadStatus::Closed => {
                if let Some(appt) = latest {
                    push_mirror(&mut writes, appt, AppointmentStatus::Closed);
                }
                if !snapshot.closing_exists {
                    writes.push(ensure_closing(lead, latest.map(|a| a.id.clone())));
                }
            }
            LeadStatus::Scheduled => {
                let schedule = schedule.clone().unwrap_or_default();
                match latest {
                    Some(appt)
                        if *from == LeadStatus::Rescheduled
                            && appt.status == AppointmentStatus::Rescheduled =>
                    {
                        push_mirror(&mut writes, appt, AppointmentStatus::Scheduled);
                        if let Some(when) = schedule.scheduled_for {
                            writes.push(DerivedWrite::RescheduleAppointment {
                                appointment_id: appt.id.clone(),
                                scheduled_for: when,
                            });
                        }
                    }
                    _ => writes.push(DerivedWrite::CreateAppointment(NewAppointment {
                        lead_id: lead.id.clone(),
                        tenant_id: lead.tenant_id.clone(),
                        clinic_id: schedule.clinic_id.or_else(|| lead.clinic_id.clone()),
                        scheduled_for: schedule.scheduled_for,
                        consultant_id: lead.assigned_consultant_id.clone(),
                        sdr_id: lead.assigned_sdr_id.clone(),
                        internal_consultant_id: lead.assigned_internal_consultant_id.clone(),
                    })),
                }
            }
            LeadStatus::Rescheduled => {
                if let Some(appt) = latest {
                    push_mirror(&mut writes, appt, AppointmentStatus::Rescheduled);
                    if let Some(when) = schedule.as_ref().and_then(|s| s.scheduled_for.clone()) {
                        writes.push(DerivedWrite::RescheduleAppointment {
                            appointment_id: appt.id.clone(),
                            scheduled_for: when,
                        });
                    }
                }
            }
            LeadStatus::Attended | LeadStatus::NoShow | LeadStatus::DidNotClose => {
                if let (Some(appt), Some(mirror)) = (latest, AppointmentStatus::mirror_of(*to)) {
                    push_mirror(&mut writes, appt, mirror);
                }
            }
            _ => {}
        },

        AppliedTransition::Appointment { appointment_id, to, .. } => {
            if *to == AppointmentStatus::Closed {
                // A signed deal closes the lead from any status
                if lead.status != LeadStatus::Closed {
                    push_lead_mirror(&mut writes, lead, LeadStatus::Closed);
                }
                if !snapshot.closing_exists {
                    writes.push(ensure_closing(lead, Some(appointment_id.clone())));
                }
            } else if lead.status.can_transition_to(to.lead_status()) {
                push_lead_mirror(&mut writes, lead, to.lead_status());
            }
        }
    }

    debug!(lead = %lead.id, transition = ?transition, writes = writes.len(), "Planned cascade");
    writes
}

fn push_mirror(writes: &mut Vec<DerivedWrite>, appt: &AppointmentRow, status: AppointmentStatus) {
    if appt.status.can_transition_to(status) {
        writes.push(DerivedWrite::SetAppointmentStatus {
            appointment_id: appt.id.clone(),
            expected: appt.status,
            status,
        });
    }
}

fn push_lead_mirror(writes: &mut Vec<DerivedWrite>, lead: &LeadRow, status: LeadStatus) {
    writes.push(DerivedWrite::SetLeadStatus {
        lead_id: lead.id.clone(),
        expected: lead.status,
        status,
    });
}

fn ensure_closing(lead: &LeadRow, appointment_id: Option<String>) -> DerivedWrite {
    DerivedWrite::EnsureClosing(NewClosing::placeholder(
        lead.id.clone(),
        appointment_id,
        lead.tenant_id.clone(),
        lead.assigned_consultant_id.clone(),
    ))
}

/// A derived write that changed a row, for the audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeEffect {
    pub kind: MovementKind,
    pub entity: EntityRef,
    pub description: String,
}

/// Apply derived writes in order
pub fn execute(
    conn: &Connection,
    writes: &[DerivedWrite],
) -> Result<Vec<CascadeEffect>, PipelineError> {
    let mut effects = Vec::with_capacity(writes.len());

    for write in writes {
        match write {
            DerivedWrite::SetAppointmentStatus { appointment_id, expected, status } => {
                if appointments::update_status_if(conn, appointment_id, *expected, *status)? == 0 {
                    return Err(PipelineError::Conflict(format!(
                        "Appointment {} is no longer {}",
                        appointment_id, expected
                    )));
                }
                effects.push(CascadeEffect {
                    kind: MovementKind::AppointmentStatusChanged,
                    entity: EntityRef::appointment(appointment_id.clone()),
                    description: format!("{} -> {} (cascade)", expected, status),
                });
            }
            DerivedWrite::CreateAppointment(input) => {
                let id = appointments::insert_appointment(conn, input)?;
                effects.push(CascadeEffect {
                    kind: MovementKind::AppointmentCreated,
                    entity: EntityRef::appointment(id),
                    description: format!(
                        "Scheduled at {} for {}",
                        input.clinic_id.as_deref().unwrap_or("unassigned clinic"),
                        input.scheduled_for.as_deref().unwrap_or("a date to be defined")
                    ),
                });
            }
            DerivedWrite::RescheduleAppointment { appointment_id, scheduled_for } => {
                appointments::set_scheduled_for(
                    conn,
                    appointment_id,
                    Some(scheduled_for.as_str()),
                )?;
                effects.push(CascadeEffect {
                    kind: MovementKind::AppointmentRescheduled,
                    entity: EntityRef::appointment(appointment_id.clone()),
                    description: format!("Moved to {}", scheduled_for),
                });
            }
            DerivedWrite::SetLeadStatus { lead_id, expected, status } => {
                if leads::update_status_if(conn, lead_id, *expected, *status)? == 0 {
                    return Err(PipelineError::Conflict(format!(
                        "Lead {} is no longer {}",
                        lead_id, expected
                    )));
                }
                effects.push(CascadeEffect {
                    kind: MovementKind::StatusChanged,
                    entity: EntityRef::lead(lead_id.clone()),
                    description: format!("{} -> {} (cascade)", expected, status),
                });
            }
            DerivedWrite::EnsureClosing(input) => {
                if let Some(id) = closings::insert_if_absent(conn, input)? {
                    effects.push(CascadeEffect {
                        kind: MovementKind::ClosingCreated,
                        entity: EntityRef::closing(id),
                        description: format!(
                            "Closing created: value {}, {}, {}",
                            input.value_cents, input.approval, input.payment_method
                        ),
                    });
                }
            }
        }
    }

    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::leads::{insert_lead, NewLead};
    use crate::db::schema::init_schema;
    use crate::pipeline::ClosingApproval;
    use crate::scope::Predicate;

    fn lead(status: LeadStatus) -> LeadRow {
        LeadRow {
            id: "L2".into(),
            tenant_id: Some("t1".into()),
            display_name: "Bia".into(),
            phone: None,
            email: None,
            tax_id: None,
            status,
            assigned_consultant_id: Some("c-1".into()),
            assigned_sdr_id: Some("s-1".into()),
            assigned_internal_consultant_id: None,
            clinic_id: Some("clinic-a".into()),
            created_at: "n".into(),
            updated_at: "n".into(),
        }
    }

    fn appt(status: AppointmentStatus) -> AppointmentRow {
        AppointmentRow {
            id: "A1".into(),
            lead_id: "L2".into(),
            tenant_id: Some("t1".into()),
            clinic_id: Some("clinic-a".into()),
            scheduled_for: None,
            status,
            consultant_id: Some("c-1".into()),
            sdr_id: Some("s-1".into()),
            internal_consultant_id: None,
            created_at: "n".into(),
            updated_at: "n".into(),
        }
    }

    fn closed_transition() -> AppliedTransition {
        AppliedTransition::Lead {
            from: LeadStatus::Attended,
            to: LeadStatus::Closed,
            schedule: None,
        }
    }

    #[test]
    fn test_lead_closed_closes_appointment_and_creates_closing() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Attended),
            latest_appointment: Some(appt(AppointmentStatus::Attended)),
            closing_exists: false,
        };
        let writes = apply_cascade(&closed_transition(), &snapshot);
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0],
            DerivedWrite::SetAppointmentStatus {
                appointment_id: "A1".into(),
                expected: AppointmentStatus::Attended,
                status: AppointmentStatus::Closed,
            }
        );
        match &writes[1] {
            DerivedWrite::EnsureClosing(c) => {
                assert_eq!(c.value_cents, 0);
                assert_eq!(c.approval, ClosingApproval::Approved);
                assert_eq!(c.appointment_id.as_deref(), Some("A1"));
                assert_eq!(c.consultant_id.as_deref(), Some("c-1"));
            }
            other => panic!("unexpected write {:?}", other),
        }
    }

    #[test]
    fn test_existing_closing_not_recreated() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Attended),
            latest_appointment: None,
            closing_exists: true,
        };
        assert!(apply_cascade(&closed_transition(), &snapshot).is_empty());
    }

    #[test]
    fn test_scheduled_creates_appointment_with_snapshot() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::InConversation),
            latest_appointment: None,
            closing_exists: false,
        };
        let transition = AppliedTransition::Lead {
            from: LeadStatus::InConversation,
            to: LeadStatus::Scheduled,
            schedule: Some(ScheduleDetails {
                clinic_id: None,
                scheduled_for: Some("2026-11-02T14:00:00Z".into()),
            }),
        };
        let writes = apply_cascade(&transition, &snapshot);
        match writes.as_slice() {
            [DerivedWrite::CreateAppointment(a)] => {
                assert_eq!(a.clinic_id.as_deref(), Some("clinic-a"));
                assert_eq!(a.sdr_id.as_deref(), Some("s-1"));
                assert_eq!(a.scheduled_for.as_deref(), Some("2026-11-02T14:00:00Z"));
            }
            other => panic!("unexpected writes {:?}", other),
        }
    }

    #[test]
    fn test_back_to_scheduled_reuses_rescheduled_appointment() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Rescheduled),
            latest_appointment: Some(appt(AppointmentStatus::Rescheduled)),
            closing_exists: false,
        };
        let transition = AppliedTransition::Lead {
            from: LeadStatus::Rescheduled,
            to: LeadStatus::Scheduled,
            schedule: Some(ScheduleDetails {
                clinic_id: None,
                scheduled_for: Some("2026-11-09".into()),
            }),
        };
        let writes = apply_cascade(&transition, &snapshot);
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[1], DerivedWrite::RescheduleAppointment { .. }));
    }

    #[test]
    fn test_mirror_skips_illegal_appointment_edge() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Scheduled),
            latest_appointment: Some(appt(AppointmentStatus::Closed)),
            closing_exists: false,
        };
        let transition = AppliedTransition::Lead {
            from: LeadStatus::Scheduled,
            to: LeadStatus::NoShow,
            schedule: None,
        };
        assert!(apply_cascade(&transition, &snapshot).is_empty());
    }

    #[test]
    fn test_appointment_closed_closes_lead() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Scheduled),
            latest_appointment: Some(appt(AppointmentStatus::Scheduled)),
            closing_exists: false,
        };
        let transition = AppliedTransition::Appointment {
            appointment_id: "A1".into(),
            from: AppointmentStatus::Scheduled,
            to: AppointmentStatus::Closed,
        };
        let writes = apply_cascade(&transition, &snapshot);
        assert_eq!(
            writes[0],
            DerivedWrite::SetLeadStatus {
                lead_id: "L2".into(),
                expected: LeadStatus::Scheduled,
                status: LeadStatus::Closed,
            }
        );
        assert!(matches!(writes[1], DerivedWrite::EnsureClosing(_)));
    }

    #[test]
    fn test_appointment_outcome_mirrors_onto_lead() {
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Scheduled),
            latest_appointment: Some(appt(AppointmentStatus::Scheduled)),
            closing_exists: false,
        };
        for (to, expected) in [
            (AppointmentStatus::Attended, LeadStatus::Attended),
            (AppointmentStatus::NoShow, LeadStatus::NoShow),
            (AppointmentStatus::DidNotClose, LeadStatus::DidNotClose),
            (AppointmentStatus::Rescheduled, LeadStatus::Rescheduled),
        ] {
            let transition = AppliedTransition::Appointment {
                appointment_id: "A1".into(),
                from: AppointmentStatus::Scheduled,
                to,
            };
            assert_eq!(
                apply_cascade(&transition, &snapshot),
                vec![DerivedWrite::SetLeadStatus {
                    lead_id: "L2".into(),
                    expected: LeadStatus::Scheduled,
                    status: expected,
                }]
            );
        }
    }

    #[test]
    fn test_appointment_mirror_skips_illegal_lead_edge() {
        // Lead already attended; an appointment rebooking has no lead edge back
        let snapshot = CascadeSnapshot {
            lead: lead(LeadStatus::Attended),
            latest_appointment: Some(appt(AppointmentStatus::Rescheduled)),
            closing_exists: false,
        };
        let transition = AppliedTransition::Appointment {
            appointment_id: "A1".into(),
            from: AppointmentStatus::Rescheduled,
            to: AppointmentStatus::Scheduled,
        };
        assert!(apply_cascade(&transition, &snapshot).is_empty());
    }

    #[test]
    fn test_execute_twice_yields_one_closing() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let row = insert_lead(
            &conn,
            &NewLead {
                tenant_id: Some("t1".into()),
                display_name: "Bia".into(),
                ..Default::default()
            },
            LeadStatus::Closed,
        )
        .unwrap();
        let snapshot = CascadeSnapshot::load(&conn, row).unwrap();
        let writes = apply_cascade(&closed_transition(), &snapshot);

        let first = execute(&conn, &writes).unwrap();
        let second = execute(&conn, &writes).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        let closings = closings::list_closings(&conn, &Predicate::All, None).unwrap();
        assert_eq!(closings.len(), 1);
    }

    #[test]
    fn test_execute_stale_expected_status_conflicts() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let row = insert_lead(
            &conn,
            &NewLead { display_name: "Ana".into(), ..Default::default() },
            LeadStatus::Lead,
        )
        .unwrap();
        let writes = vec![DerivedWrite::SetLeadStatus {
            lead_id: row.id,
            expected: LeadStatus::Attended,
            status: LeadStatus::Closed,
        }];
        assert!(matches!(execute(&conn, &writes), Err(PipelineError::Conflict(_))));
    }
}
