//! Evidence rows
//!
//! Rows are write-once and are never deleted (both enforced by triggers).
//! An evidence row is consumed once a movement references its id.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{current_timestamp, new_id};
use crate::error::PipelineError;
use crate::pipeline::EntityType;
use crate::scope::Predicate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRow {
    pub id: String,
    pub lead_id: String,
    pub tenant_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub blob_key: String,
    pub blob_url: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub file_name: Option<String>,
    pub uploaded_by: String,
    pub created_at: String,
}

impl EvidenceRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            tenant_id: row.get("tenant_id")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            from_status: row.get("from_status")?,
            to_status: row.get("to_status")?,
            blob_key: row.get("blob_key")?,
            blob_url: row.get("blob_url")?,
            content_type: row.get("content_type")?,
            size_bytes: row.get("size_bytes")?,
            file_name: row.get("file_name")?,
            uploaded_by: row.get("uploaded_by")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub lead_id: String,
    pub tenant_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub blob_key: String,
    pub blob_url: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub file_name: Option<String>,
    pub uploaded_by: String,
}

pub fn insert_evidence(
    conn: &Connection,
    input: &NewEvidence,
) -> Result<EvidenceRow, PipelineError> {
    let id = new_id();

    conn.execute(
        "INSERT INTO evidence (id, lead_id, tenant_id, entity_type, entity_id, from_status, \
         to_status, blob_key, blob_url, content_type, size_bytes, file_name, uploaded_by, \
         created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            input.lead_id,
            input.tenant_id,
            input.entity_type.as_str(),
            input.entity_id,
            input.from_status,
            input.to_status,
            input.blob_key,
            input.blob_url,
            input.content_type,
            input.size_bytes as i64,
            input.file_name,
            input.uploaded_by,
            current_timestamp(),
        ],
    )?;

    get_evidence(conn, &id)?
        .ok_or_else(|| PipelineError::Internal("Failed to retrieve inserted evidence".into()))
}

/// Unscoped lookup, used by the evidence gate inside a unit of work
pub fn get_evidence(conn: &Connection, id: &str) -> Result<Option<EvidenceRow>, PipelineError> {
    let row = conn
        .query_row("SELECT * FROM evidence WHERE id = ?1", params![id], EvidenceRow::from_row)
        .optional()?;
    Ok(row)
}

/// Evidence uploaded for one entity, within scope
pub fn list_for_entity(
    conn: &Connection,
    scope: &Predicate,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<EvidenceRow>, PipelineError> {
    let (clause, mut values) = scope.to_sql(None);
    let sql = format!(
        "SELECT * FROM evidence WHERE entity_type = ? AND entity_id = ? AND {} \
         ORDER BY created_at ASC",
        clause
    );
    values.insert(0, entity_id.to_string().into());
    values.insert(0, entity_type.as_str().to_string().into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), EvidenceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Whether a movement already references this evidence
pub fn is_consumed(conn: &Connection, evidence_id: &str) -> Result<bool, PipelineError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM movements WHERE evidence_id = ?1 LIMIT 1",
            params![evidence_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
