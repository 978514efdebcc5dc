//! Pipeline state machine
//!
//! Legality of a transition is decided here, independently of who asks and of
//! whether evidence exists. The service layer composes this with the actor
//! capability gate, the scope resolver and the evidence gate.

pub mod status;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GuardViolation, PipelineError};

pub use status::{AppointmentStatus, ClosingApproval, LeadStatus, PipelineState};

/// Entities that carry a pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Lead,
    Appointment,
    Closing,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Lead => "lead",
            EntityType::Appointment => "appointment",
            EntityType::Closing => "closing",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" => Ok(EntityType::Lead),
            "appointment" => Ok(EntityType::Appointment),
            "closing" => Ok(EntityType::Closing),
            other => Err(PipelineError::Validation(format!("Unknown entity type: {}", other))),
        }
    }
}

/// Reference to one row of a pipeline entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn lead(id: impl Into<String>) -> Self {
        Self { entity_type: EntityType::Lead, entity_id: id.into() }
    }

    pub fn appointment(id: impl Into<String>) -> Self {
        Self { entity_type: EntityType::Appointment, entity_id: id.into() }
    }

    pub fn closing(id: impl Into<String>) -> Self {
        Self { entity_type: EntityType::Closing, entity_id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// What the state machine decided for a requested status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan<S> {
    /// Requested status equals the current one; succeed without writing
    NoOp,
    Apply { from: S, to: S },
}

/// Check a requested transition against the edge table of `S`
pub fn plan_transition<S: PipelineState>(
    current: S,
    target: S,
) -> Result<TransitionPlan<S>, GuardViolation> {
    if current == target {
        return Ok(TransitionPlan::NoOp);
    }
    if !current.can_transition_to(target) {
        return Err(GuardViolation::IllegalTransition {
            entity: S::ENTITY.as_str(),
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    Ok(TransitionPlan::Apply { from: current, to: target })
}
