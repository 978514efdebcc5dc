//! Closing CRUD operations
//!
//! A lead has at most one closing. `insert_if_absent` leans on the unique
//! index over `lead_id`, so a racing second insert is ignored rather than
//! duplicated.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{current_timestamp, new_id};
use crate::error::PipelineError;
use crate::pipeline::ClosingApproval;
use crate::scope::Predicate;

/// Payment method recorded on closings the cascade creates
pub const DEFAULT_PAYMENT_METHOD: &str = "to be defined";

/// Closing row from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingRow {
    pub id: String,
    pub lead_id: String,
    pub appointment_id: Option<String>,
    pub tenant_id: Option<String>,
    pub consultant_id: Option<String>,
    pub value_cents: i64,
    pub payment_method: String,
    pub approval: ClosingApproval,
    pub contract_blob_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ClosingRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            appointment_id: row.get("appointment_id")?,
            tenant_id: row.get("tenant_id")?,
            consultant_id: row.get("consultant_id")?,
            value_cents: row.get("value_cents")?,
            payment_method: row.get("payment_method")?,
            approval: row.get("approval")?,
            contract_blob_key: row.get("contract_blob_key")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClosing {
    pub lead_id: String,
    pub appointment_id: Option<String>,
    pub tenant_id: Option<String>,
    pub consultant_id: Option<String>,
    pub value_cents: i64,
    pub payment_method: String,
    pub approval: ClosingApproval,
}

impl NewClosing {
    /// Placeholder closing: zero value, approved, payment to be defined
    pub fn placeholder(
        lead_id: impl Into<String>,
        appointment_id: Option<String>,
        tenant_id: Option<String>,
        consultant_id: Option<String>,
    ) -> Self {
        Self {
            lead_id: lead_id.into(),
            appointment_id,
            tenant_id,
            consultant_id,
            value_cents: 0,
            payment_method: DEFAULT_PAYMENT_METHOD.to_string(),
            approval: ClosingApproval::Approved,
        }
    }
}

pub fn get_closing(
    conn: &Connection,
    id: &str,
    scope: &Predicate,
) -> Result<Option<ClosingRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let sql = format!("SELECT * FROM closings WHERE id = ? AND {}", clause);
    values.insert(0, id.to_string().into());

    let row = conn
        .query_row(&sql, params_from_iter(values.iter()), ClosingRow::from_row)
        .optional()?;
    Ok(row)
}

pub fn exists_for_lead(conn: &Connection, lead_id: &str) -> Result<bool, PipelineError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM closings WHERE lead_id = ?1", params![lead_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// List closings within scope, optionally filtered by approval
pub fn list_closings(
    conn: &Connection,
    scope: &Predicate,
    approval: Option<ClosingApproval>,
) -> Result<Vec<ClosingRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let mut conditions = vec![clause];

    if let Some(approval) = approval {
        conditions.push("approval = ?".to_string());
        values.push(approval.as_str().to_string().into());
    }

    let sql = format!(
        "SELECT * FROM closings WHERE {} ORDER BY created_at DESC",
        conditions.join(" AND ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), ClosingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert unless the lead already has a closing. Returns the new id, or
/// `None` when one already existed.
pub fn insert_if_absent(
    conn: &Connection,
    input: &NewClosing,
) -> Result<Option<String>, PipelineError> {
    let id = new_id();
    let now = current_timestamp();

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO closings (id, lead_id, appointment_id, tenant_id, consultant_id, \
         value_cents, payment_method, approval, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            id,
            input.lead_id,
            input.appointment_id,
            input.tenant_id,
            input.consultant_id,
            input.value_cents,
            input.payment_method,
            input.approval,
            now,
        ],
    )?;

    Ok(if inserted == 1 { Some(id) } else { None })
}

/// Compare-and-set the approval. Returns rows changed.
pub fn set_approval_if(
    conn: &Connection,
    id: &str,
    expected: ClosingApproval,
    approval: ClosingApproval,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE closings SET approval = ?3, updated_at = ?4 WHERE id = ?1 AND approval = ?2",
        params![id, expected, approval, current_timestamp()],
    )?;
    Ok(changed)
}

pub fn update_terms(
    conn: &Connection,
    id: &str,
    value_cents: i64,
    payment_method: &str,
) -> Result<usize, PipelineError> {
    if value_cents < 0 {
        return Err(PipelineError::Validation("Closing value cannot be negative".into()));
    }
    let payment_method = payment_method.trim();
    if payment_method.is_empty() {
        return Err(PipelineError::Validation("paymentMethod is required".into()));
    }

    let changed = conn.execute(
        "UPDATE closings SET value_cents = ?2, payment_method = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, value_cents, payment_method, current_timestamp()],
    )?;
    Ok(changed)
}

pub fn set_contract_key(
    conn: &Connection,
    id: &str,
    blob_key: &str,
) -> Result<usize, PipelineError> {
    let changed = conn.execute(
        "UPDATE closings SET contract_blob_key = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, blob_key, current_timestamp()],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn_with_lead() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO leads (id, tenant_id, display_name, status, created_at, updated_at) \
             VALUES ('L2', 't1', 'Bia', 'closed', 'n', 'n')",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_if_absent_is_idempotent() {
        let conn = conn_with_lead();
        let closing = NewClosing::placeholder("L2", None, Some("t1".into()), None);

        let id = insert_if_absent(&conn, &closing).unwrap().unwrap();
        assert!(insert_if_absent(&conn, &closing).unwrap().is_none());

        let row = get_closing(&conn, &id, &Predicate::All).unwrap().unwrap();
        assert_eq!(row.value_cents, 0);
        assert_eq!(row.approval, ClosingApproval::Approved);
        assert_eq!(row.payment_method, DEFAULT_PAYMENT_METHOD);
        assert!(exists_for_lead(&conn, "L2").unwrap());
    }

    #[test]
    fn test_approval_compare_and_set() {
        let conn = conn_with_lead();
        let id = insert_if_absent(&conn, &NewClosing::placeholder("L2", None, None, None))
            .unwrap()
            .unwrap();
        assert_eq!(
            set_approval_if(&conn, &id, ClosingApproval::Pending, ClosingApproval::Rejected)
                .unwrap(),
            0
        );
        assert_eq!(
            set_approval_if(&conn, &id, ClosingApproval::Approved, ClosingApproval::Rejected)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_terms_validated() {
        let conn = conn_with_lead();
        let id = insert_if_absent(&conn, &NewClosing::placeholder("L2", None, None, None))
            .unwrap()
            .unwrap();
        assert!(update_terms(&conn, &id, -1, "pix").is_err());
        assert!(update_terms(&conn, &id, 100, " ").is_err());
        assert_eq!(update_terms(&conn, &id, 250_000, "credit card").unwrap(), 1);

        let row = get_closing(&conn, &id, &Predicate::All).unwrap().unwrap();
        assert_eq!(row.value_cents, 250_000);
    }
}
