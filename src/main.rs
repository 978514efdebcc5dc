//! Referral Pipeline CLI
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and default config
//! referral-pipeline init
//!
//! # Public intake
//! referral-pipeline intake form.json
//!
//! # Claim and move a lead (claims files hold session claims as JSON)
//! referral-pipeline claim --claims sdr.json <lead-id>
//! referral-pipeline transition --claims sdr.json <lead-id> scheduled \
//!     --scheduled-for 2026-11-02T14:00:00Z
//! referral-pipeline evidence --claims sdr.json --lead <lead-id> \
//!     --to rejected_no_response --file chat.png
//! referral-pipeline transition --claims sdr.json <lead-id> rejected_no_response \
//!     --evidence <evidence-id>
//!
//! # Inspect
//! referral-pipeline leads --claims partner.json
//! referral-pipeline history --claims partner.json <lead-id>
//! referral-pipeline stats
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use referral_pipeline::cascade::ScheduleDetails;
use referral_pipeline::db::leads::LeadQuery;
use referral_pipeline::services::{spawn_logging_listener, EvidenceUpload, IntakeForm};
use referral_pipeline::{
    Actor, Config, EntityRef, FsBlobStore, LeadStatus, PipelineDb, Services, SessionClaims,
    TransitionRequest,
};

#[derive(Parser, Debug)]
#[command(name = "referral-pipeline")]
#[command(about = "Lead pipeline state machine for a multi-tenant referral network")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory (database, blobs, config.toml)
    #[arg(long, env = "PIPELINE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Busy timeout for the database write lock, in milliseconds
    #[arg(long, env = "PIPELINE_BUSY_TIMEOUT_MS")]
    busy_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, env = "PIPELINE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or migrate the database and write the default config
    Init,

    /// Row counts per table
    Stats,

    /// Register a lead from a public intake form (JSON file or inline JSON)
    Intake { form: String },

    /// Claim an unassigned lead
    Claim {
        #[arg(long)]
        claims: String,
        lead_id: String,
    },

    /// Move a lead to a new status
    Transition {
        #[arg(long)]
        claims: String,
        lead_id: String,
        status: LeadStatus,
        /// Evidence id justifying a negative outcome
        #[arg(long)]
        evidence: Option<String>,
        #[arg(long)]
        scheduled_for: Option<String>,
        #[arg(long)]
        clinic: Option<String>,
    },

    /// Upload evidence for a pending lead transition
    Evidence {
        #[arg(long)]
        claims: String,
        #[arg(long)]
        lead: String,
        /// Status the evidence justifies
        #[arg(long)]
        to: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },

    /// List visible leads
    Leads {
        #[arg(long)]
        claims: String,
        #[arg(long)]
        status: Option<LeadStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Movement history of a lead
    History {
        #[arg(long)]
        claims: String,
        lead_id: String,
    },
}

/// Read session claims from a file, or inline JSON
fn load_actor(claims: &str) -> Result<Actor> {
    let raw = read_json_arg(claims)?;
    let claims: SessionClaims = serde_json::from_str(&raw).context("Invalid session claims")?;
    Ok(Actor::from_claims(&claims)?)
}

fn read_json_arg(value: &str) -> Result<String> {
    if value.trim_start().starts_with('{') {
        Ok(value.to_string())
    } else {
        std::fs::read_to_string(value).with_context(|| format!("Failed to read {}", value))
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("referral_pipeline=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    // Load config
    let mut config = match (&args.config, &args.storage_dir) {
        (Some(path), _) => {
            Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?
        }
        (None, Some(dir)) => Config::load_or_default(dir)?,
        (None, None) => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(ms) = args.busy_timeout_ms {
        config.busy_timeout_ms = ms;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let db = Arc::new(PipelineDb::open_with_timeout(
        &config.database_path(),
        config.busy_timeout(),
    )?);
    let blobs = Arc::new(FsBlobStore::new(config.blobs_dir()).await?);
    let services = Services::new(db.clone(), blobs, config.upload_policy(), config.event_capacity);
    let listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            info!(database = %config.database_path().display(), "Database ready");
        }
        Command::Stats => print_json(&db.stats()?)?,
        Command::Intake { form } => {
            let form: IntakeForm =
                serde_json::from_str(&read_json_arg(&form)?).context("Invalid intake form")?;
            print_json(&services.intake.submit(form)?)?;
        }
        Command::Claim { claims, lead_id } => {
            let actor = load_actor(&claims)?;
            print_json(&services.pipeline.claim(&actor, &lead_id)?)?;
        }
        Command::Transition { claims, lead_id, status, evidence, scheduled_for, clinic } => {
            let actor = load_actor(&claims)?;
            let mut request = TransitionRequest::new(lead_id, status);
            request.evidence_id = evidence;
            if scheduled_for.is_some() || clinic.is_some() {
                request =
                    request.with_schedule(ScheduleDetails { clinic_id: clinic, scheduled_for });
            }
            print_json(&services.pipeline.transition_lead(&actor, &request)?)?;
        }
        Command::Evidence { claims, lead, to, file, content_type } => {
            let actor = load_actor(&claims)?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let upload = EvidenceUpload {
                entity: EntityRef::lead(lead),
                to_status: to,
                content_type: content_type.unwrap_or_else(|| guess_content_type(&file).to_string()),
                file_name: file.file_name().map(|n| n.to_string_lossy().into_owned()),
                bytes,
            };
            print_json(&services.evidence.upload_evidence(&actor, upload).await?)?;
        }
        Command::Leads { claims, status, limit } => {
            let actor = load_actor(&claims)?;
            let query = LeadQuery { status, limit, ..Default::default() };
            print_json(&services.pipeline.list_leads(&actor, &query)?)?;
        }
        Command::History { claims, lead_id } => {
            let actor = load_actor(&claims)?;
            print_json(&services.pipeline.history(&actor, &lead_id)?)?;
        }
    }

    // Let the listener drain what this command emitted
    drop(services);
    let _ = listener.await;

    Ok(())
}
