//! Artifact store collaborator.
//!
//! Diagnostic payloads (traces, screenshots, logs) are handed to an
//! [`ArtifactStore`]; attempts keep only the reference it returns.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::executor::DiagnosticPayload;

/// Identifies the attempt a payload belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactKey<'a> {
    pub test_id: &'a str,
    pub attempt: u32,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores a payload and returns its reference, or `None` if the store
    /// discards payloads.
    async fn store(
        &self,
        key: ArtifactKey<'_>,
        payload: &DiagnosticPayload,
    ) -> Result<Option<String>>;
}

/// Discards every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullArtifactStore;

#[async_trait]
impl ArtifactStore for NullArtifactStore {
    async fn store(
        &self,
        _key: ArtifactKey<'_>,
        _payload: &DiagnosticPayload,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Writes payloads below a local directory.
///
/// Layout: `<root>/<slug>-<hash>/attempt-<n>/<name>`, where the slug is a
/// filesystem-safe prefix of the test id and the hash keeps distinct ids
/// apart. The returned reference is the path relative to the root.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn test_dir(test_id: &str) -> String {
        let slug: String = test_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(60)
            .collect();
        let digest = Sha256::digest(test_id.as_bytes());
        let hash: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}", slug.trim_matches('-'), hash)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        key: ArtifactKey<'_>,
        payload: &DiagnosticPayload,
    ) -> Result<Option<String>> {
        let file_name = Path::new(&payload.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        let relative = PathBuf::from(Self::test_dir(key.test_id))
            .join(format!("attempt-{}", key.attempt))
            .join(file_name);
        let path = self.root.join(&relative);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &payload.content)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;

        Ok(Some(relative.to_string_lossy().replace('\\', "/")))
    }
}
