//! Artifact references and the artifact storage seam.
//!
//! The pipeline never moves artifact bytes over the queue; messages carry
//! opaque locators and stage executors resolve them through an
//! [`ArtifactStore`].

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque locator for a stored artifact (page image, OCR text, diff overlay,
/// summary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte storage behind artifact locators.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes and return a stable locator for them.
    async fn put(&self, bytes: Bytes) -> Result<ArtifactRef, ArtifactError>;

    /// Fetch the bytes for a locator. `None` if the locator is unknown.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Option<Bytes>, ArtifactError>;
}

/// Content-addressed filesystem store: the blake3 digest of the bytes is the
/// locator, so identical content always maps to one file.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root.join(artifact.as_str())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Bytes) -> Result<ArtifactRef, ArtifactError> {
        let digest = blake3::hash(&bytes).to_hex().to_string();
        let artifact = ArtifactRef::new(digest);
        let path = self.path_for(&artifact);
        if tokio::fs::try_exists(&path).await? {
            return Ok(artifact);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Option<Bytes>, ArtifactError> {
        match tokio::fs::read(self.path_for(artifact)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
