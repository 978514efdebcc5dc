//! SQLite database module for pipeline storage
//!
//! ## Tables
//!
//! - `leads` - Root pipeline entity, tenant- and consultant-scoped
//! - `appointments` - Visits derived from a lead, with an assignment snapshot
//! - `closings` - At most one per lead (unique index on `lead_id`)
//! - `evidence` - Write-once proof artifacts gating negative transitions
//! - `movements` - Append-only audit log (UPDATE/DELETE rejected by triggers)

pub mod schema;
pub mod leads;
pub mod appointments;
pub mod closings;
pub mod evidence;
pub mod movements;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::scope::LinkageLookup;

/// Default busy timeout when another connection holds the write lock
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database for the pipeline
pub struct PipelineDb {
    conn: Mutex<Connection>,
}

impl PipelineDb {
    /// Open or create the pipeline database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, PipelineError> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit busy timeout
    pub fn open_with_timeout(
        db_path: &Path,
        busy_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;

        // WAL lets readers proceed while a claim or transition holds the write lock
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, PipelineError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), PipelineError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&Connection) -> Result<T, PipelineError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PipelineError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&mut Connection) -> Result<T, PipelineError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| PipelineError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` unit of work.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back every write made
    /// through the transaction.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, PipelineError>,
    {
        self.with_conn_mut(|conn| {
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&mut tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Row counts per table
    pub fn stats(&self) -> Result<DbStats, PipelineError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, PipelineError> {
                let sql = format!("SELECT COUNT(*) FROM {}", table);
                let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                lead_count: count("leads")?,
                appointment_count: count("appointments")?,
                closing_count: count("closings")?,
                evidence_count: count("evidence")?,
                movement_count: count("movements")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub lead_count: u64,
    pub appointment_count: u64,
    pub closing_count: u64,
    pub evidence_count: u64,
    pub movement_count: u64,
}

/// RFC 3339 timestamp used for every `*_at` column
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn collect_ids(conn: &Connection, sql: &str, value: &str) -> Result<Vec<String>, PipelineError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![value], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

impl LinkageLookup for Connection {
    fn consultant_linked_lead_ids(
        &self,
        consultant_id: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let sql = "SELECT lead_id FROM appointments \
                   WHERE consultant_id = ?1 OR sdr_id = ?1 OR internal_consultant_id = ?1 \
                   UNION \
                   SELECT lead_id FROM closings WHERE consultant_id = ?1";
        collect_ids(self, sql, consultant_id)
    }

    fn clinic_linked_lead_ids(&self, clinic_id: &str) -> Result<Vec<String>, PipelineError> {
        collect_ids(
            self,
            "SELECT DISTINCT lead_id FROM appointments WHERE clinic_id = ?1",
            clinic_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_has_empty_tables() {
        let db = PipelineDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.lead_count, 0);
        assert_eq!(stats.movement_count, 0);
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let db = PipelineDb::open_in_memory().unwrap();
        let result: Result<(), PipelineError> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO leads (id, display_name, status, created_at, updated_at) \
                 VALUES ('L1', 'Ana', 'lead', 'now', 'now')",
                [],
            )?;
            Err(PipelineError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.stats().unwrap().lead_count, 0);
    }

    #[test]
    fn test_linkage_through_appointments_and_closings() {
        use crate::db::appointments::{insert_appointment, NewAppointment};
        use crate::db::closings::{insert_if_absent, NewClosing};
        use crate::db::leads::{insert_lead, NewLead};
        use crate::pipeline::LeadStatus;

        let db = PipelineDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let lead = NewLead {
                tenant_id: Some("t1".into()),
                display_name: "Ana".into(),
                ..Default::default()
            };
            let booked = insert_lead(conn, &lead, LeadStatus::Scheduled)?;
            let signed = insert_lead(conn, &lead, LeadStatus::Closed)?;
            insert_lead(conn, &lead, LeadStatus::Lead)?;

            insert_appointment(
                conn,
                &NewAppointment {
                    lead_id: booked.id.clone(),
                    tenant_id: Some("t1".into()),
                    clinic_id: Some("clinic-a".into()),
                    scheduled_for: None,
                    consultant_id: Some("f-2".into()),
                    sdr_id: None,
                    internal_consultant_id: None,
                },
            )?;
            let closing =
                NewClosing::placeholder(signed.id.clone(), None, None, Some("f-2".into()));
            insert_if_absent(conn, &closing)?;

            let mut linked = conn.consultant_linked_lead_ids("f-2")?;
            linked.sort();
            let mut expected = vec![booked.id.clone(), signed.id];
            expected.sort();
            assert_eq!(linked, expected);

            assert_eq!(conn.clinic_linked_lead_ids("clinic-a")?, vec![booked.id]);
            assert!(conn.clinic_linked_lead_ids("clinic-b")?.is_empty());
            assert!(conn.consultant_linked_lead_ids("f-9")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
