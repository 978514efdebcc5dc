//! Content-addressed blob storage for evidence and contracts
//!
//! Blobs are keyed by `sha256-<hex>` of their bytes and laid out under
//! `<root>/<first 4 hex chars>/<key>` for filesystem distribution. The store
//! only moves bytes; content type and ownership live in the database rows
//! that reference the key.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binary storage collaborator
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `key`, returning a URL for the stored object
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Returns whether a blob was removed
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;
}

/// Compute the content key of `data`
pub fn compute_key(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a blob store rooted at `root_dir`
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, BlobError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
        {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        let hash_part = key.strip_prefix("sha256-").unwrap_or(key);
        let subdir = hash_part.get(..4).unwrap_or(hash_part);
        Ok(self.root_dir.join(subdir).join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        let path = self.blob_path(key)?;

        if fs::metadata(&path).await.is_ok() {
            debug!(key = %key, "Blob already exists");
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, bytes).await?;
            info!(key = %key, size = bytes.len(), content_type = %content_type, "Stored blob");
        }

        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(key = %key, "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
