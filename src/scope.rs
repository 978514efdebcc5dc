//! Scope resolver: which rows an actor may read or act on
//!
//! `resolve_lead_scope` turns an `Actor` into a `Predicate` over the `leads`
//! table. Child tables (appointments, closings, evidence) have no tenant or
//! consultant columns of their own, so `resolve_scope` filters children by
//! `lead_id` membership in a subquery over the visible leads. The lead set is
//! never materialized in memory or bound as parameters.
//!
//! Every empty set compiles to an always-false clause; an actor whose
//! linkage is empty sees nothing, never everything.

use rusqlite::types::Value;
use tracing::debug;

use crate::actor::{Actor, Role};
use crate::error::PipelineError;

/// Composable row filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// No restriction
    All,
    /// Matches no row
    Nothing,
    Eq(&'static str, String),
    In(&'static str, Vec<String>),
    Or(Vec<Predicate>),
    /// `column IN (SELECT id FROM leads WHERE <predicate>)`
    InLeads(&'static str, Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: &'static str, value: impl Into<String>) -> Self {
        Predicate::Eq(column, value.into())
    }

    /// Compile into a SQL boolean expression and positional parameters.
    ///
    /// `alias` prefixes every column (e.g. `l` for `l.tenant_id`).
    pub fn to_sql(&self, alias: Option<&str>) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.write_sql(alias, &mut params);
        (sql, params)
    }

    fn write_sql(&self, alias: Option<&str>, params: &mut Vec<Value>) -> String {
        let col = |name: &str| match alias {
            Some(a) => format!("{}.{}", a, name),
            None => name.to_string(),
        };

        match self {
            Predicate::All => "1 = 1".to_string(),
            Predicate::Nothing => "1 = 0".to_string(),
            Predicate::Eq(column, value) => {
                params.push(Value::Text(value.clone()));
                format!("{} = ?", col(column))
            }
            Predicate::In(_, values) if values.is_empty() => "1 = 0".to_string(),
            Predicate::In(column, values) => {
                let placeholders: Vec<_> = values.iter().map(|_| "?").collect();
                for v in values {
                    params.push(Value::Text(v.clone()));
                }
                format!("{} IN ({})", col(column), placeholders.join(", "))
            }
            Predicate::Or(parts) if parts.is_empty() => "1 = 0".to_string(),
            Predicate::Or(parts) => {
                let clauses: Vec<String> =
                    parts.iter().map(|p| p.write_sql(alias, params)).collect();
                format!("({})", clauses.join(" OR "))
            }
            Predicate::InLeads(column, leads) => {
                let inner = leads.write_sql(None, params);
                format!("{} IN (SELECT id FROM leads WHERE {})", col(column), inner)
            }
        }
    }
}

/// Pipeline tables a scope can be resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopedTable {
    Leads,
    Appointments,
    Closings,
    Evidence,
}

/// Store lookups needed to compute linkage-based visibility
pub trait LinkageLookup {
    /// Leads reachable through appointments or closings naming this consultant
    fn consultant_linked_lead_ids(&self, consultant_id: &str) -> Result<Vec<String>, PipelineError>;

    /// Leads with at least one appointment at this clinic
    fn clinic_linked_lead_ids(&self, clinic_id: &str) -> Result<Vec<String>, PipelineError>;
}

/// Resolve the lead-table predicate for an actor. First match wins.
pub fn resolve_lead_scope(
    actor: &Actor,
    lookup: &dyn LinkageLookup,
) -> Result<Predicate, PipelineError> {
    let predicate = match actor.role() {
        Role::Admin => match actor.tenant_id() {
            Some(tenant) => Predicate::eq("tenant_id", tenant),
            None => Predicate::All,
        },
        Role::Partner => match actor.tenant_id() {
            Some(tenant) => Predicate::eq("tenant_id", tenant),
            None => Predicate::Nothing,
        },
        Role::InternalConsultant => match actor.tenant_id() {
            Some(tenant) => Predicate::eq("tenant_id", tenant),
            None => Predicate::Nothing,
        },
        Role::FreelanceConsultant { .. } => {
            let me = actor.self_id();
            let mut parts = vec![
                Predicate::eq("assigned_consultant_id", me),
                Predicate::eq("assigned_sdr_id", me),
            ];
            let linked = lookup.consultant_linked_lead_ids(me)?;
            if !linked.is_empty() {
                parts.push(Predicate::In("id", linked));
            }
            Predicate::Or(parts)
        }
        Role::Clinic => match actor.clinic_id() {
            Some(clinic) => {
                let mut parts = vec![Predicate::eq("clinic_id", clinic)];
                let linked = lookup.clinic_linked_lead_ids(clinic)?;
                if !linked.is_empty() {
                    parts.push(Predicate::In("id", linked));
                }
                Predicate::Or(parts)
            }
            None => Predicate::Nothing,
        },
        Role::Patient => Predicate::eq("id", actor.self_id()),
    };

    debug!(actor = %actor, predicate = ?predicate, "Resolved lead scope");
    Ok(predicate)
}

/// Resolve the predicate for any pipeline table
pub fn resolve_scope(
    actor: &Actor,
    table: ScopedTable,
    lookup: &dyn LinkageLookup,
) -> Result<Predicate, PipelineError> {
    let leads = resolve_lead_scope(actor, lookup)?;
    if table == ScopedTable::Leads {
        return Ok(leads);
    }

    Ok(match leads {
        Predicate::All => Predicate::All,
        Predicate::Nothing => Predicate::Nothing,
        other => Predicate::InLeads("lead_id", Box::new(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed linkage for resolver tests
    struct FakeLinks {
        consultant: Vec<String>,
        clinic: Vec<String>,
    }

    impl FakeLinks {
        fn empty() -> Self {
            Self { consultant: vec![], clinic: vec![] }
        }
    }

    impl LinkageLookup for FakeLinks {
        fn consultant_linked_lead_ids(&self, _: &str) -> Result<Vec<String>, PipelineError> {
            Ok(self.consultant.clone())
        }
        fn clinic_linked_lead_ids(&self, _: &str) -> Result<Vec<String>, PipelineError> {
            Ok(self.clinic.clone())
        }
    }

    #[test]
    fn test_admin_scopes() {
        let links = FakeLinks::empty();
        assert_eq!(resolve_lead_scope(&Actor::admin("a"), &links).unwrap(), Predicate::All);
        assert_eq!(
            resolve_lead_scope(&Actor::tenant_admin("a", "t1"), &links).unwrap(),
            Predicate::eq("tenant_id", "t1")
        );
    }

    #[test]
    fn test_internal_consultant_sees_tenant() {
        let links = FakeLinks::empty();
        let actor = Actor::internal_consultant("i-1", "t1");
        assert_eq!(resolve_lead_scope(&actor, &links).unwrap(), Predicate::eq("tenant_id", "t1"));
    }

    #[test]
    fn test_freelancer_is_never_tenant_wide() {
        let links = FakeLinks::empty();
        let actor = Actor::freelance_consultant("f-1", Some("t1".into()), false);
        let predicate = resolve_lead_scope(&actor, &links).unwrap();
        let (sql, params) = predicate.to_sql(None);
        assert_eq!(sql, "(assigned_consultant_id = ? OR assigned_sdr_id = ?)");
        assert_eq!(params.len(), 2);
        assert!(!sql.contains("tenant_id"));
    }

    #[test]
    fn test_freelancer_linked_ids_included() {
        let links = FakeLinks { consultant: vec!["L9".into()], ..FakeLinks::empty() };
        let actor = Actor::freelance_consultant("f-1", None, true);
        let (sql, params) = resolve_lead_scope(&actor, &links).unwrap().to_sql(Some("l"));
        assert_eq!(sql, "(l.assigned_consultant_id = ? OR l.assigned_sdr_id = ? OR l.id IN (?))");
        assert_eq!(params[2], Value::Text("L9".into()));
    }

    #[test]
    fn test_clinic_without_clinic_id_sees_nothing() {
        let links = FakeLinks::empty();
        let claims = crate::actor::SessionClaims {
            role: "clinic".into(),
            self_id: "c".into(),
            ..Default::default()
        };
        let actor = Actor::from_claims(&claims).unwrap();
        assert_eq!(resolve_lead_scope(&actor, &links).unwrap(), Predicate::Nothing);
    }

    #[test]
    fn test_partner_without_tenant_fails_closed() {
        let links = FakeLinks::empty();
        let claims = crate::actor::SessionClaims {
            role: "partner".into(),
            self_id: "p".into(),
            ..Default::default()
        };
        let actor = Actor::from_claims(&claims).unwrap();
        assert_eq!(resolve_lead_scope(&actor, &links).unwrap(), Predicate::Nothing);
    }

    #[test]
    fn test_patient_sees_only_self() {
        let links = FakeLinks::empty();
        assert_eq!(
            resolve_lead_scope(&Actor::patient("L1"), &links).unwrap(),
            Predicate::eq("id", "L1")
        );
    }

    #[test]
    fn test_child_scope_without_tenant_fails_closed() {
        let links = FakeLinks::empty();
        let claims = crate::actor::SessionClaims {
            role: "partner".into(),
            self_id: "p".into(),
            ..Default::default()
        };
        let actor = Actor::from_claims(&claims).unwrap();
        assert_eq!(
            resolve_scope(&actor, ScopedTable::Appointments, &links).unwrap(),
            Predicate::Nothing
        );
    }

    #[test]
    fn test_child_scope_is_lead_subquery() {
        let links = FakeLinks::empty();
        let actor = Actor::partner("p", "t1");
        let predicate = resolve_scope(&actor, ScopedTable::Closings, &links).unwrap();
        let (sql, params) = predicate.to_sql(Some("c"));
        assert_eq!(sql, "c.lead_id IN (SELECT id FROM leads WHERE tenant_id = ?)");
        assert_eq!(params, vec![Value::Text("t1".into())]);

        assert_eq!(
            resolve_scope(&Actor::admin("a"), ScopedTable::Evidence, &links).unwrap(),
            Predicate::All
        );
    }

    #[test]
    fn test_child_scope_of_unlinked_freelancer_matches_nothing() {
        let links = FakeLinks::empty();
        let actor = Actor::freelance_consultant("f-1", None, false);
        let (sql, params) = resolve_scope(&actor, ScopedTable::Appointments, &links)
            .unwrap()
            .to_sql(None);
        assert_eq!(
            sql,
            "lead_id IN (SELECT id FROM leads WHERE \
             (assigned_consultant_id = ? OR assigned_sdr_id = ?))"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_empty_compositions_compile_false() {
        assert_eq!(Predicate::In("id", vec![]).to_sql(None).0, "1 = 0");
        assert_eq!(Predicate::Or(vec![]).to_sql(None).0, "1 = 0");
        assert_eq!(Predicate::Nothing.to_sql(None).0, "1 = 0");
        assert_eq!(
            Predicate::InLeads("lead_id", Box::new(Predicate::Nothing)).to_sql(None).0,
            "lead_id IN (SELECT id FROM leads WHERE 1 = 0)"
        );
    }
}
