//! Concurrent claim resolution against a shared database file
//!
//! Every claimant holds its own connection, the way separate request
//! handlers would, and all of them race for the same unassigned lead.

use std::sync::{Arc, Barrier};
use std::thread;

use referral_pipeline::services::{EventBus, IntakeForm, IntakeService, PipelineService};
use referral_pipeline::{Actor, LeadStatus, PipelineDb, PipelineError};
use tempfile::TempDir;

const CLAIMANTS: usize = 8;

fn seed_lead(db: Arc<PipelineDb>) -> String {
    IntakeService::new(db, Arc::new(EventBus::new()))
        .submit(IntakeForm {
            tenant_id: Some("t1".into()),
            display_name: "Rui".into(),
            phone: Some("11 95555-1234".into()),
            ..Default::default()
        })
        .unwrap()
        .id
}

/// Exactly one of N simultaneous claims wins; the rest see a conflict
#[test]
fn test_single_winner() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pipeline.db");

    // First open creates the schema
    let seed_db = Arc::new(PipelineDb::open(&path).unwrap());
    let lead_id = seed_lead(seed_db.clone());

    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|i| {
            let db = Arc::new(PipelineDb::open(&path).unwrap());
            let barrier = barrier.clone();
            let lead_id = lead_id.clone();
            thread::spawn(move || {
                let service = PipelineService::new(db, Arc::new(EventBus::new()));
                let actor = Actor::internal_consultant(format!("sdr-{}", i), "t1");
                barrier.wait();
                (actor.self_id().to_string(), service.claim(&actor, &lead_id))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(winners.len(), 1);
    let conflicts = results
        .iter()
        .filter(|(_, r)| matches!(r, Err(PipelineError::Conflict(_))))
        .count();
    assert_eq!(conflicts, CLAIMANTS - 1);

    let service = PipelineService::new(seed_db, Arc::new(EventBus::new()));
    let lead = service.get_lead(&Actor::admin("root"), &lead_id).unwrap();
    assert_eq!(lead.status, LeadStatus::InConversation);
    assert_eq!(lead.assigned_sdr_id.as_deref(), Some(winners[0].as_str()));

    let claims = service
        .history(&Actor::admin("root"), &lead_id)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == "lead_claimed")
        .count();
    assert_eq!(claims, 1);
}

/// A second claim after the first has settled is still a conflict
#[test]
fn test_reclaim_by_other_sdr_conflicts() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(PipelineDb::open(&temp_dir.path().join("pipeline.db")).unwrap());
    let lead_id = seed_lead(db.clone());
    let service = PipelineService::new(db, Arc::new(EventBus::new()));

    service.claim(&Actor::internal_consultant("sdr-a", "t1"), &lead_id).unwrap();
    let err = service
        .claim(&Actor::internal_consultant("sdr-b", "t1"), &lead_id)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Conflict(_)));
    assert!(!err.is_retryable());
}
