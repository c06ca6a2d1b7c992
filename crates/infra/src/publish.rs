//! Phase 2 of a refresh: handing the persisted artifact set to the outside.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use viewforge_core::{SourceSlug, ViewArtifact};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish I/O error for {slug}: {source}")]
    Io {
        slug: String,
        #[source]
        source: std::io::Error,
    },
    #[error("publish encoding error for {slug}: {source}")]
    Encode {
        slug: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("publish target rejected {slug}: {reason}")]
    Rejected { slug: String, reason: String },
}

/// Pushes a source's artifact set to an external consumer.
///
/// Publishing the same set twice must be harmless: a refresh that fails
/// after publishing is retried from the start.
#[async_trait::async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, slug: &SourceSlug, artifacts: &[ViewArtifact]) -> Result<(), PublishError>;
}

#[async_trait::async_trait]
impl<P> ArtifactPublisher for Arc<P>
where
    P: ArtifactPublisher + ?Sized,
{
    async fn publish(&self, slug: &SourceSlug, artifacts: &[ViewArtifact]) -> Result<(), PublishError> {
        (**self).publish(slug, artifacts).await
    }
}

/// Publisher that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait::async_trait]
impl ArtifactPublisher for NoopPublisher {
    async fn publish(&self, slug: &SourceSlug, artifacts: &[ViewArtifact]) -> Result<(), PublishError> {
        debug!(slug = %slug, artifact_count = artifacts.len(), "publish skipped");
        Ok(())
    }
}

#[derive(Serialize)]
struct PublishedDocument<'a> {
    slug: &'a SourceSlug,
    artifacts: &'a [ViewArtifact],
}

/// Writes `<dir>/<slug>.json` for each published source.
///
/// The document is written to a uniquely named temporary sibling and renamed
/// into place, so readers see either the previous or the new file, and two
/// workers publishing the same source never share a staging file.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, slug: &SourceSlug) -> PathBuf {
        self.dir.join(format!("{}.json", slug.as_str()))
    }
}

#[async_trait::async_trait]
impl ArtifactPublisher for DirectoryPublisher {
    #[instrument(skip(self, artifacts), fields(slug = %slug, artifact_count = artifacts.len()), err)]
    async fn publish(&self, slug: &SourceSlug, artifacts: &[ViewArtifact]) -> Result<(), PublishError> {
        let io = |source| PublishError::Io {
            slug: slug.to_string(),
            source,
        };

        let body = serde_json::to_vec_pretty(&PublishedDocument { slug, artifacts }).map_err(|source| {
            PublishError::Encode {
                slug: slug.to_string(),
                source,
            }
        })?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let target = self.path_for(slug);
        let staging = self.dir.join(format!(
            ".{}.{}.json.tmp",
            slug.as_str(),
            uuid::Uuid::now_v7().simple()
        ));
        let written = match tokio::fs::write(&staging, &body).await {
            Ok(()) => tokio::fs::rename(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io(e));
        }
        Ok(())
    }
}
