//! Configuration providers

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use crate::error::{ProxyError, Result};

/// Versioned source of the routing settings document
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Opaque token that changes whenever the document changes
    async fn current_version(&self) -> Result<String>;

    /// Current document text and its version
    async fn fetch(&self) -> Result<(String, String)>;
}

/// Settings stored in a local TOML file.
///
/// The version is derived from the modification time and length.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn current_version(&self) -> Result<String> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            ProxyError::Config(format!("Failed to stat {}: {}", self.path.display(), e))
        })?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(format!("{}-{}", modified, metadata.len()))
    }

    async fn fetch(&self) -> Result<(String, String)> {
        let version = self.current_version().await?;
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        Ok((text, version))
    }
}
