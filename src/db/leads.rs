//! Lead CRUD operations
//!
//! Every read takes the caller's scope `Predicate`; rows outside it behave as
//! if they did not exist.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{current_timestamp, new_id};
use crate::error::PipelineError;
use crate::pipeline::LeadStatus;
use crate::scope::Predicate;

/// Lead row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRow {
    pub id: String,
    pub tenant_id: Option<String>,
    pub display_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub tax_id: Option<String>,
    pub status: LeadStatus,
    /// Referrer who originated the lead
    pub assigned_consultant_id: Option<String>,
    /// Claiming SDR; set at most once
    pub assigned_sdr_id: Option<String>,
    pub assigned_internal_consultant_id: Option<String>,
    pub clinic_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl LeadRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            display_name: row.get("display_name")?,
            phone: row.get("phone")?,
            email: row.get("email")?,
            tax_id: row.get("tax_id")?,
            status: row.get("status")?,
            assigned_consultant_id: row.get("assigned_consultant_id")?,
            assigned_sdr_id: row.get("assigned_sdr_id")?,
            assigned_internal_consultant_id: row.get("assigned_internal_consultant_id")?,
            clinic_id: row.get("clinic_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Consultant ids linked to this lead, for audit records
    pub fn related_consultant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = [
            &self.assigned_consultant_id,
            &self.assigned_sdr_id,
            &self.assigned_internal_consultant_id,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        ids.dedup();
        ids
    }
}

/// Input for inserting a lead; contact fields are normalized on insert
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewLead {
    pub tenant_id: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub assigned_consultant_id: Option<String>,
    #[serde(default)]
    pub clinic_id: Option<String>,
}

/// Query parameters for listing leads
#[derive(Debug, Clone, Deserialize)]
pub struct LeadQuery {
    #[serde(default)]
    pub status: Option<LeadStatus>,
    /// Only leads nobody has claimed yet
    #[serde(default)]
    pub unclaimed: bool,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for LeadQuery {
    fn default() -> Self {
        Self { status: None, unclaimed: false, search: None, limit: default_limit(), offset: 0 }
    }
}

/// Keep digits only
pub fn normalize_digits(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

pub fn normalize_email(value: &str) -> Option<String> {
    let email = value.trim().to_lowercase();
    if email.is_empty() { None } else { Some(email) }
}

/// Get a lead by ID within scope
pub fn get_lead(
    conn: &Connection,
    id: &str,
    scope: &Predicate,
) -> Result<Option<LeadRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let sql = format!("SELECT * FROM leads WHERE id = ? AND {}", clause);
    values.insert(0, id.to_string().into());

    let row = conn
        .query_row(&sql, params_from_iter(values.iter()), LeadRow::from_row)
        .optional()?;
    Ok(row)
}

/// List leads within scope
pub fn list_leads(
    conn: &Connection,
    scope: &Predicate,
    query: &LeadQuery,
) -> Result<Vec<LeadRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let mut conditions = vec![clause];

    if let Some(status) = query.status {
        conditions.push("status = ?".to_string());
        values.push(status.as_str().to_string().into());
    }

    if query.unclaimed {
        conditions.push("assigned_sdr_id IS NULL".to_string());
    }

    if let Some(ref search) = query.search {
        conditions.push("(display_name LIKE ? OR email LIKE ? OR phone LIKE ?)".to_string());
        let pattern = format!("%{}%", search);
        for _ in 0..3 {
            values.push(pattern.clone().into());
        }
    }

    let sql = format!(
        "SELECT * FROM leads WHERE {} ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
        conditions.join(" AND ")
    );
    values.push((query.limit as i64).into());
    values.push((query.offset as i64).into());

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), LeadRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Find a lead in the same tenant sharing any normalized contact field
pub fn find_by_contact(
    conn: &Connection,
    tenant_id: Option<&str>,
    phone: Option<&str>,
    email: Option<&str>,
    tax_id: Option<&str>,
) -> Result<Option<String>, PipelineError> {
    let phone = phone.and_then(normalize_digits);
    let email = email.and_then(normalize_email);
    let tax_id = tax_id.and_then(normalize_digits);

    if phone.is_none() && email.is_none() && tax_id.is_none() {
        return Ok(None);
    }

    let id = conn
        .query_row(
            "SELECT id FROM leads WHERE tenant_id IS ?1 \
             AND ((?2 IS NOT NULL AND phone = ?2) \
               OR (?3 IS NOT NULL AND email = ?3) \
               OR (?4 IS NOT NULL AND tax_id = ?4)) \
             LIMIT 1",
            params![tenant_id, phone, email, tax_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

/// Insert a lead at the given initial status
pub fn insert_lead(
    conn: &Connection,
    input: &NewLead,
    status: LeadStatus,
) -> Result<LeadRow, PipelineError> {
    let display_name = input.display_name.trim();
    if display_name.is_empty() {
        return Err(PipelineError::Validation("displayName is required".into()));
    }

    let id = new_id();
    let now = current_timestamp();

    conn.execute(
        "INSERT INTO leads (id, tenant_id, display_name, phone, email, tax_id, status, \
         assigned_consultant_id, clinic_id, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id,
            input.tenant_id,
            display_name,
            input.phone.as_deref().and_then(normalize_digits),
            input.email.as_deref().and_then(normalize_email),
            input.tax_id.as_deref().and_then(normalize_digits),
            status,
            input.assigned_consultant_id,
            input.clinic_id,
            now,
        ],
    )?;

    get_lead(conn, &id, &Predicate::All)?
        .ok_or_else(|| PipelineError::Internal("Failed to retrieve inserted lead".into()))
}

/// Insert unless a lead in the same tenant already shares a contact field
pub fn insert_unique(
    conn: &Connection,
    input: &NewLead,
    status: LeadStatus,
) -> Result<LeadRow, PipelineError> {
    if let Some(existing) = find_by_contact(
        conn,
        input.tenant_id.as_deref(),
        input.phone.as_deref(),
        input.email.as_deref(),
        input.tax_id.as_deref(),
    )? {
        return Err(PipelineError::Conflict(format!(
            "A lead with the same contact already exists ({})",
            existing
        )));
    }
    insert_lead(conn, input, status)
}

/// Compare-and-set the status. Returns the number of rows changed (0 or 1).
pub fn update_status_if(
    conn: &Connection,
    id: &str,
    expected: LeadStatus,
    status: LeadStatus,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE leads SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, expected, status, current_timestamp()],
    )?;
    Ok(changed)
}

/// Claim an unassigned lead in one conditional write.
///
/// The null check and the assignment are the same statement, so of N racing
/// claimants exactly one sees a changed row.
pub fn claim_unassigned(
    conn: &Connection,
    id: &str,
    claimant_id: &str,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE leads SET assigned_sdr_id = ?2, \
         status = CASE status WHEN ?3 THEN ?4 ELSE status END, \
         updated_at = ?5 \
         WHERE id = ?1 AND assigned_sdr_id IS NULL",
        params![
            id,
            claimant_id,
            LeadStatus::Lead,
            LeadStatus::InConversation,
            current_timestamp()
        ],
    )?;
    Ok(changed)
}

pub fn set_internal_consultant(
    conn: &Connection,
    id: &str,
    consultant_id: &str,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE leads SET assigned_internal_consultant_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, consultant_id, current_timestamp()],
    )?;
    Ok(changed)
}

/// Rows removed by a lead delete
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletedLead {
    pub appointments: usize,
    pub closings: usize,
}

/// Hard-delete a lead with its appointments and closing. Evidence and
/// movements are kept.
pub fn delete_lead(conn: &Connection, id: &str) -> Result<Option<DeletedLead>, PipelineError> {
    let closings = conn.execute("DELETE FROM closings WHERE lead_id = ?1", params![id])?;
    let appointments = conn.execute("DELETE FROM appointments WHERE lead_id = ?1", params![id])?;
    let leads = conn.execute("DELETE FROM leads WHERE id = ?1", params![id])?;

    if leads == 0 {
        return Ok(None);
    }
    Ok(Some(DeletedLead { appointments, closings }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn new_lead(tenant: &str, name: &str) -> NewLead {
        NewLead {
            tenant_id: Some(tenant.into()),
            display_name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_normalizes_contacts() {
        let conn = conn();
        let lead = insert_lead(
            &conn,
            &NewLead {
                phone: Some("(11) 98888-7777".into()),
                email: Some("  Ana@Example.COM ".into()),
                tax_id: Some("123.456.789-00".into()),
                ..new_lead("t1", "Ana")
            },
            LeadStatus::Lead,
        )
        .unwrap();
        assert_eq!(lead.phone.as_deref(), Some("11988887777"));
        assert_eq!(lead.email.as_deref(), Some("ana@example.com"));
        assert_eq!(lead.tax_id.as_deref(), Some("12345678900"));
        assert_eq!(lead.status, LeadStatus::Lead);
    }

    #[test]
    fn test_blank_name_rejected() {
        let conn = conn();
        let err = insert_lead(&conn, &new_lead("t1", "  "), LeadStatus::Lead).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_scope_hides_rows() {
        let conn = conn();
        let lead = insert_lead(&conn, &new_lead("t1", "Ana"), LeadStatus::Lead).unwrap();
        assert!(get_lead(&conn, &lead.id, &Predicate::eq("tenant_id", "t2")).unwrap().is_none());
        assert!(get_lead(&conn, &lead.id, &Predicate::eq("tenant_id", "t1")).unwrap().is_some());
        assert!(get_lead(&conn, &lead.id, &Predicate::Nothing).unwrap().is_none());
    }

    #[test]
    fn test_claim_is_compare_and_set() {
        let conn = conn();
        let lead = insert_lead(&conn, &new_lead("t1", "Ana"), LeadStatus::Lead).unwrap();

        assert_eq!(claim_unassigned(&conn, &lead.id, "s1").unwrap(), 1);
        assert_eq!(claim_unassigned(&conn, &lead.id, "s2").unwrap(), 0);

        let lead = get_lead(&conn, &lead.id, &Predicate::All).unwrap().unwrap();
        assert_eq!(lead.assigned_sdr_id.as_deref(), Some("s1"));
        assert_eq!(lead.status, LeadStatus::InConversation);
    }

    #[test]
    fn test_claim_keeps_non_lead_status() {
        let conn = conn();
        let lead = insert_lead(&conn, &new_lead("t1", "Bia"), LeadStatus::Patient).unwrap();
        assert_eq!(claim_unassigned(&conn, &lead.id, "s1").unwrap(), 1);
        let lead = get_lead(&conn, &lead.id, &Predicate::All).unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Patient);
    }

    #[test]
    fn test_status_update_requires_expected() {
        let conn = conn();
        let lead = insert_lead(&conn, &new_lead("t1", "Ana"), LeadStatus::Lead).unwrap();
        assert_eq!(
            update_status_if(&conn, &lead.id, LeadStatus::Scheduled, LeadStatus::Attended).unwrap(),
            0
        );
        assert_eq!(
            update_status_if(&conn, &lead.id, LeadStatus::Lead, LeadStatus::InConversation)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_find_by_contact_is_tenant_local() {
        let conn = conn();
        insert_lead(
            &conn,
            &NewLead { email: Some("ana@example.com".into()), ..new_lead("t1", "Ana") },
            LeadStatus::Lead,
        )
        .unwrap();

        assert!(find_by_contact(&conn, Some("t1"), None, Some("ANA@example.com"), None)
            .unwrap()
            .is_some());
        assert!(find_by_contact(&conn, Some("t2"), None, Some("ana@example.com"), None)
            .unwrap()
            .is_none());
        assert!(find_by_contact(&conn, Some("t1"), None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_list_filters_unclaimed() {
        let conn = conn();
        let a = insert_lead(&conn, &new_lead("t1", "Ana"), LeadStatus::Lead).unwrap();
        insert_lead(&conn, &new_lead("t1", "Bia"), LeadStatus::Lead).unwrap();
        claim_unassigned(&conn, &a.id, "s1").unwrap();

        let query = LeadQuery { unclaimed: true, limit: 10, ..Default::default() };
        let rows = list_leads(&conn, &Predicate::All, &query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].display_name, "Bia");
    }
}
