//! Configuration for referral-pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::events::DEFAULT_EVENT_CAPACITY;
use crate::upload::{UploadPolicy, DEFAULT_DOCUMENT_MAX_BYTES, DEFAULT_EVIDENCE_MAX_BYTES};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("referral-pipeline")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for the database and blobs
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name, relative to `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Upper bound for evidence uploads
    #[serde(default = "default_evidence_max_bytes")]
    pub evidence_max_bytes: u64,

    /// Upper bound for contract and other document uploads
    #[serde(default = "default_document_max_bytes")]
    pub document_max_bytes: u64,

    /// Notification channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long a write waits on another writer before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database_file() -> String {
    "pipeline.db".to_string()
}

fn default_evidence_max_bytes() -> u64 {
    DEFAULT_EVIDENCE_MAX_BYTES
}

fn default_document_max_bytes() -> u64 {
    DEFAULT_DOCUMENT_MAX_BYTES
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            evidence_max_bytes: default_evidence_max_bytes(),
            document_max_bytes: default_document_max_bytes(),
            event_capacity: default_event_capacity(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Load `config.toml` from the storage dir, falling back to defaults
    pub fn load_or_default(storage_dir: &Path) -> Result<Self, std::io::Error> {
        let path = Self::config_path_in(storage_dir);
        if path.exists() {
            let mut config = Self::load(&path)?;
            config.storage_dir = storage_dir.to_path_buf();
            Ok(config)
        } else {
            Ok(Self {
                storage_dir: storage_dir.to_path_buf(),
                ..Self::default()
            })
        }
    }

    fn config_path_in(storage_dir: &Path) -> PathBuf {
        storage_dir.join("config.toml")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        Self::config_path_in(&self.storage_dir)
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            evidence_max_bytes: self.evidence_max_bytes,
            document_max_bytes: self.document_max_bytes,
        }
    }
}
