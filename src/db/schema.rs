//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::PipelineError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), PipelineError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, PipelineError> {
    conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", [])?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), PipelineError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), PipelineError> {
    conn.execute_batch(LEADS_SCHEMA)?;
    conn.execute_batch(APPOINTMENTS_SCHEMA)?;
    conn.execute_batch(CLOSINGS_SCHEMA)?;
    conn.execute_batch(EVIDENCE_SCHEMA)?;
    conn.execute_batch(MOVEMENTS_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

const LEADS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    display_name TEXT NOT NULL,
    phone TEXT,
    email TEXT,
    tax_id TEXT,
    status TEXT NOT NULL,
    assigned_consultant_id TEXT,
    assigned_sdr_id TEXT,
    assigned_internal_consultant_id TEXT,
    clinic_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const APPOINTMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS appointments (
    id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
    tenant_id TEXT,
    clinic_id TEXT,
    scheduled_for TEXT,
    status TEXT NOT NULL,
    consultant_id TEXT,
    sdr_id TEXT,
    internal_consultant_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const CLOSINGS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS closings (
    id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
    appointment_id TEXT,
    tenant_id TEXT,
    consultant_id TEXT,
    value_cents INTEGER NOT NULL DEFAULT 0,
    payment_method TEXT NOT NULL,
    approval TEXT NOT NULL,
    contract_blob_key TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_closings_one_per_lead ON closings(lead_id);
"#;

// Evidence outlives the lead it justified, so no foreign key here
const EVIDENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS evidence (
    id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL,
    tenant_id TEXT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    blob_key TEXT NOT NULL,
    blob_url TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    file_name TEXT,
    uploaded_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS evidence_write_once
BEFORE UPDATE ON evidence
BEGIN
    SELECT RAISE(ABORT, 'evidence is write-once');
END;

CREATE TRIGGER IF NOT EXISTS evidence_never_deleted
BEFORE DELETE ON evidence
BEGIN
    SELECT RAISE(ABORT, 'evidence is never deleted');
END;
"#;

const MOVEMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS movements (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_role TEXT NOT NULL,
    description TEXT NOT NULL,
    related_consultant_ids TEXT NOT NULL DEFAULT '[]',
    tenant_id TEXT,
    evidence_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS movements_append_only_update
BEFORE UPDATE ON movements
BEGIN
    SELECT RAISE(ABORT, 'movements are append-only');
END;

CREATE TRIGGER IF NOT EXISTS movements_append_only_delete
BEFORE DELETE ON movements
BEGIN
    SELECT RAISE(ABORT, 'movements are append-only');
END;
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);
CREATE INDEX IF NOT EXISTS idx_leads_consultant ON leads(assigned_consultant_id);
CREATE INDEX IF NOT EXISTS idx_leads_sdr ON leads(assigned_sdr_id);
CREATE INDEX IF NOT EXISTS idx_leads_clinic ON leads(clinic_id);
CREATE INDEX IF NOT EXISTS idx_leads_phone ON leads(tenant_id, phone);
CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(tenant_id, email);
CREATE INDEX IF NOT EXISTS idx_appointments_lead ON appointments(lead_id, created_at);
CREATE INDEX IF NOT EXISTS idx_appointments_clinic ON appointments(clinic_id);
CREATE INDEX IF NOT EXISTS idx_evidence_entity ON evidence(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_movements_entity ON movements(entity_type, entity_id, seq);
CREATE INDEX IF NOT EXISTS idx_movements_evidence ON movements(evidence_id);
"#;
