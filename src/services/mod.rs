//! Service layer
//!
//! Services own the unit-of-work boundaries and compose the guards:
//!
//! ```text
//! CLI / transport (thin)
//!     ↓
//! Service Layer (capability, scope, state machine, evidence, cascade, audit)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod evidence_service;
pub mod intake_service;
pub mod pipeline_service;

pub use events::{spawn_logging_listener, EventBus, EventListener, PipelineEvent};
pub use evidence_service::{EvidenceService, EvidenceUpload};
pub use intake_service::{IntakeForm, IntakeService};
pub use pipeline_service::{PipelineService, TransitionOutcome, TransitionRequest};

use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::db::PipelineDb;
use crate::upload::UploadPolicy;

/// Service container with a shared database and event bus
pub struct Services {
    pub pipeline: Arc<PipelineService>,
    pub evidence: Arc<EvidenceService>,
    pub intake: Arc<IntakeService>,
    pub events: Arc<EventBus>,
}

impl Services {
    pub fn new(
        db: Arc<PipelineDb>,
        blobs: Arc<dyn BlobStore>,
        policy: UploadPolicy,
        event_capacity: usize,
    ) -> Self {
        let events = Arc::new(EventBus::with_capacity(event_capacity));

        Self {
            pipeline: Arc::new(PipelineService::new(db.clone(), events.clone())),
            evidence: Arc::new(EvidenceService::new(db.clone(), blobs, events.clone(), policy)),
            intake: Arc::new(IntakeService::new(db, events.clone())),
            events,
        }
    }
}
