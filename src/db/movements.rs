//! Movement rows (append-only)

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::{current_timestamp, new_id};
use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementRow {
    pub seq: i64,
    pub id: String,
    pub kind: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: String,
    pub actor_role: String,
    pub description: String,
    pub related_consultant_ids: Vec<String>,
    pub tenant_id: Option<String>,
    pub evidence_id: Option<String>,
    pub created_at: String,
}

impl MovementRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let related: String = row.get("related_consultant_ids")?;
        let related_consultant_ids = serde_json::from_str(&related).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            kind: row.get("kind")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            actor_id: row.get("actor_id")?,
            actor_role: row.get("actor_role")?,
            description: row.get("description")?,
            related_consultant_ids,
            tenant_id: row.get("tenant_id")?,
            evidence_id: row.get("evidence_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMovement<'a> {
    pub kind: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub actor_id: &'a str,
    pub actor_role: &'a str,
    pub description: &'a str,
    pub related_consultant_ids: &'a [String],
    pub tenant_id: Option<&'a str>,
    pub evidence_id: Option<&'a str>,
}

pub fn insert_movement(
    conn: &Connection,
    input: &NewMovement<'_>,
) -> Result<MovementRow, PipelineError> {
    let id = new_id();
    let now = current_timestamp();
    let related = serde_json::to_string(input.related_consultant_ids)?;

    conn.execute(
        "INSERT INTO movements (id, kind, entity_type, entity_id, actor_id, actor_role, \
         description, related_consultant_ids, tenant_id, evidence_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            input.kind,
            input.entity_type,
            input.entity_id,
            input.actor_id,
            input.actor_role,
            input.description,
            related,
            input.tenant_id,
            input.evidence_id,
            now,
        ],
    )?;

    Ok(MovementRow {
        seq: conn.last_insert_rowid(),
        id,
        kind: input.kind.to_string(),
        entity_type: input.entity_type.to_string(),
        entity_id: input.entity_id.to_string(),
        actor_id: input.actor_id.to_string(),
        actor_role: input.actor_role.to_string(),
        description: input.description.to_string(),
        related_consultant_ids: input.related_consultant_ids.to_vec(),
        tenant_id: input.tenant_id.map(String::from),
        evidence_id: input.evidence_id.map(String::from),
        created_at: now,
    })
}

/// Movements of one entity, oldest first
pub fn list_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<MovementRow>, PipelineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM movements WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![entity_type, entity_id], MovementRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every movement touching a lead: the lead itself, its appointments and its
/// closing. After a hard delete only the lead-level rows still match.
pub fn list_for_lead(conn: &Connection, lead_id: &str) -> Result<Vec<MovementRow>, PipelineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM movements \
         WHERE (entity_type = 'lead' AND entity_id = ?1) \
            OR (entity_type = 'appointment' \
                AND entity_id IN (SELECT id FROM appointments WHERE lead_id = ?1)) \
            OR (entity_type = 'closing' \
                AND entity_id IN (SELECT id FROM closings WHERE lead_id = ?1)) \
         ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![lead_id], MovementRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    #[test]
    fn test_insert_and_list_in_order() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let related = vec!["c-1".to_string(), "s-1".to_string()];

        for description in ["first", "second"] {
            insert_movement(
                &conn,
                &NewMovement {
                    kind: "status_changed",
                    entity_type: "lead",
                    entity_id: "L1",
                    actor_id: "s-1",
                    actor_role: "partner",
                    description,
                    related_consultant_ids: &related,
                    tenant_id: Some("t1"),
                    evidence_id: None,
                },
            )
            .unwrap();
        }

        let rows = list_for_entity(&conn, "lead", "L1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].description, "first");
        assert!(rows[0].seq < rows[1].seq);
        assert_eq!(rows[1].related_consultant_ids, related);
        assert_eq!(list_for_lead(&conn, "L1").unwrap().len(), 2);
    }
}
