//! Appointment CRUD operations

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{current_timestamp, new_id};
use crate::error::PipelineError;
use crate::pipeline::AppointmentStatus;
use crate::scope::Predicate;

/// Appointment row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentRow {
    pub id: String,
    pub lead_id: String,
    pub tenant_id: Option<String>,
    pub clinic_id: Option<String>,
    pub scheduled_for: Option<String>,
    pub status: AppointmentStatus,
    pub consultant_id: Option<String>,
    pub sdr_id: Option<String>,
    pub internal_consultant_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AppointmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            tenant_id: row.get("tenant_id")?,
            clinic_id: row.get("clinic_id")?,
            scheduled_for: row.get("scheduled_for")?,
            status: row.get("status")?,
            consultant_id: row.get("consultant_id")?,
            sdr_id: row.get("sdr_id")?,
            internal_consultant_id: row.get("internal_consultant_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for creating an appointment. The assignment ids are a snapshot of
/// the lead at creation time and are not kept in sync afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub lead_id: String,
    pub tenant_id: Option<String>,
    pub clinic_id: Option<String>,
    pub scheduled_for: Option<String>,
    pub consultant_id: Option<String>,
    pub sdr_id: Option<String>,
    pub internal_consultant_id: Option<String>,
}

pub fn get_appointment(
    conn: &Connection,
    id: &str,
    scope: &Predicate,
) -> Result<Option<AppointmentRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let sql = format!("SELECT * FROM appointments WHERE id = ? AND {}", clause);
    values.insert(0, id.to_string().into());

    let row = conn
        .query_row(&sql, params_from_iter(values.iter()), AppointmentRow::from_row)
        .optional()?;
    Ok(row)
}

/// Most recently created appointment of a lead
pub fn latest_for_lead(
    conn: &Connection,
    lead_id: &str,
) -> Result<Option<AppointmentRow>, PipelineError> {
    let row = conn
        .query_row(
            "SELECT * FROM appointments WHERE lead_id = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![lead_id],
            AppointmentRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// List appointments within scope, optionally for a single lead
pub fn list_appointments(
    conn: &Connection,
    scope: &Predicate,
    lead_id: Option<&str>,
) -> Result<Vec<AppointmentRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let mut conditions = vec![clause];

    if let Some(lead_id) = lead_id {
        conditions.push("lead_id = ?".to_string());
        values.push(lead_id.to_string().into());
    }

    let sql = format!(
        "SELECT * FROM appointments WHERE {} ORDER BY created_at DESC, rowid DESC",
        conditions.join(" AND ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), AppointmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert a new appointment in `scheduled`, returning its id
pub fn insert_appointment(
    conn: &Connection,
    input: &NewAppointment,
) -> Result<String, PipelineError> {
    let id = new_id();
    let now = current_timestamp();

    conn.execute(
        "INSERT INTO appointments (id, lead_id, tenant_id, clinic_id, scheduled_for, status, \
         consultant_id, sdr_id, internal_consultant_id, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id,
            input.lead_id,
            input.tenant_id,
            input.clinic_id,
            input.scheduled_for,
            AppointmentStatus::Scheduled,
            input.consultant_id,
            input.sdr_id,
            input.internal_consultant_id,
            now,
        ],
    )?;
    Ok(id)
}

/// Compare-and-set the status. Returns rows changed.
pub fn update_status_if(
    conn: &Connection,
    id: &str,
    expected: AppointmentStatus,
    status: AppointmentStatus,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE appointments SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, expected, status, current_timestamp()],
    )?;
    Ok(changed)
}

/// Move the visit date; `None` keeps the current one
pub fn set_scheduled_for(
    conn: &Connection,
    id: &str,
    scheduled_for: Option<&str>,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE appointments SET scheduled_for = COALESCE(?2, scheduled_for), updated_at = ?3 \
         WHERE id = ?1",
        params![id, scheduled_for, current_timestamp()],
    )?;
    Ok(changed)
}
