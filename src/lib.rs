//! Referral Pipeline - lead lifecycle engine for a multi-tenant referral network
//!
//! Tracks leads from first contact to a signed deal and decides who may see
//! or move what.
//!
//! ## Components
//!
//! - **Actor model** (`actor`): session claims resolved once into an explicit role
//! - **Scope resolver** (`scope`): actor to row predicate, failing closed
//! - **State machine** (`pipeline`): legal edges for leads, appointments and closings
//! - **Evidence gate** (`evidence`): negative outcomes need unconsumed, matching proof
//! - **Claim resolver** (`claim`): first claimant wins, via one conditional update
//! - **Cascade engine** (`cascade`): pure transition-to-writes mapping
//! - **Movement log** (`audit`): append-only, best effort inside the unit of work
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/referral-pipeline/
//! ├── pipeline.db            # SQLite (WAL)
//! ├── blobs/                 # Content-addressed evidence and contracts
//! │   └── abcd/sha256-abcd...
//! └── config.toml            # Configuration
//! ```

pub mod actor;
pub mod audit;
pub mod blob_store;
pub mod cascade;
pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod evidence;
pub mod pipeline;
pub mod scope;
pub mod services;
pub mod upload;

// Re-exports
pub use actor::{Actor, Role, SessionClaims};
pub use blob_store::{BlobStore, FsBlobStore};
pub use config::Config;
pub use db::PipelineDb;
pub use error::{GuardViolation, PipelineError};
pub use pipeline::{AppointmentStatus, ClosingApproval, EntityRef, EntityType, LeadStatus};
pub use services::{Services, TransitionRequest};
pub use upload::{UploadKind, UploadPolicy};
