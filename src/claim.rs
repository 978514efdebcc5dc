//! Assignment claim resolver
//!
//! First claimant wins. The existence check and the assignment are one
//! conditional UPDATE; there is no read-then-write window for a second
//! claimant to slip through.

use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::leads::{self, LeadRow};
use crate::error::PipelineError;
use crate::pipeline::LeadStatus;
use crate::scope::Predicate;

/// Result of a won claim
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub lead: LeadRow,
    /// Status before the claim; `lead` moves to `in_conversation`
    pub previous_status: LeadStatus,
}

impl ClaimOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.lead.status
    }
}

/// Claim `lead_id` for `claimant_id`.
///
/// The caller has already checked capability and scope. Zero affected rows on
/// an existing lead is a `Conflict`; nothing is written in that case.
pub fn claim(
    conn: &Connection,
    lead_id: &str,
    claimant_id: &str,
) -> Result<ClaimOutcome, PipelineError> {
    let before = leads::get_lead(conn, lead_id, &Predicate::All)?
        .ok_or_else(|| PipelineError::NotFound(format!("Lead {}", lead_id)))?;

    if leads::claim_unassigned(conn, lead_id, claimant_id)? == 0 {
        warn!(
            lead = %lead_id,
            claimant = %claimant_id,
            holder = ?before.assigned_sdr_id,
            "Claim lost"
        );
        return Err(PipelineError::Conflict(format!("Lead {} is already claimed", lead_id)));
    }

    let lead = leads::get_lead(conn, lead_id, &Predicate::All)?
        .ok_or_else(|| PipelineError::Internal(format!("Lead {} vanished after claim", lead_id)))?;

    info!(lead = %lead_id, claimant = %claimant_id, status = %lead.status, "Claim won");

    Ok(ClaimOutcome {
        lead,
        previous_status: before.status,
    })
}
