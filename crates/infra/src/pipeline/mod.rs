//! Two-phase refresh of one source's views.
//!
//! Phase 1 parses the configuration, resolves every variant and replaces the
//! source's artifact set. Phase 2 publishes that set. The source clock read at
//! the start is re-checked before persisting, before publishing, and once more
//! atomically with the final `clean` write; any mismatch ends the run as
//! [`PipelineOutcome::Superseded`] without touching later phases.

pub mod staleness;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use viewforge_core::{DomainError, RefreshStatus, SourceSlug, ViewArtifact};

use crate::error::StoreError;
use crate::jobs::Job;
use crate::publish::{ArtifactPublisher, PublishError};
use crate::sources::SourceStore;
use crate::views::{ArtifactStore, JsonViewSpecParser, ViewResolution, ViewResolver, ViewSpecParser};

pub use staleness::{Checkpoint, ClaimSnapshot, Staleness, StalenessGuard};

/// What a completed refresh produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub slug: SourceSlug,
    pub variants: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Non-error results of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Artifacts persisted and published; source marked clean.
    Completed(RefreshSummary),
    /// The source changed after the run started; a newer job owns the work.
    Superseded { checkpoint: Checkpoint },
    /// The source no longer exists.
    SourceMissing,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    InvalidConfig(DomainError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dependency catalog error: {0}")]
    Catalog(StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl PipelineError {
    /// Whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::InvalidPayload(_) | PipelineError::InvalidConfig(_) => false,
            PipelineError::Store(_) | PipelineError::Catalog(_) | PipelineError::Publish(_) => true,
        }
    }
}

/// Executes refresh jobs.
#[derive(Clone)]
pub struct RefreshPipeline {
    sources: Arc<dyn SourceStore>,
    artifacts: Arc<dyn ArtifactStore>,
    parser: Arc<dyn ViewSpecParser>,
    resolver: Arc<dyn ViewResolver>,
    publisher: Arc<dyn ArtifactPublisher>,
}

impl RefreshPipeline {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        artifacts: Arc<dyn ArtifactStore>,
        resolver: Arc<dyn ViewResolver>,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        Self {
            sources,
            artifacts,
            parser: Arc::new(JsonViewSpecParser),
            resolver,
            publisher,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ViewSpecParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn sources(&self) -> &Arc<dyn SourceStore> {
        &self.sources
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, slug = %job.key, attempt = job.attempts), err)]
    pub async fn run(&self, job: &Job) -> Result<PipelineOutcome, PipelineError> {
        let payload = job
            .refresh_payload()
            .map_err(|e| PipelineError::InvalidPayload(e.to_string()))?;
        let slug = payload.slug;

        let Some(source) = self.sources.get(&slug).await? else {
            debug!("source missing");
            return Ok(PipelineOutcome::SourceMissing);
        };
        let guard = StalenessGuard::new(self.sources.clone(), ClaimSnapshot::of(&source));
        self.sources
            .set_refresh_status(&slug, RefreshStatus::Refreshing)
            .await?;

        // Phase 1: compute.
        let specs = self
            .parser
            .parse(&source.config)
            .map_err(PipelineError::InvalidConfig)?;
        let mut artifacts = Vec::with_capacity(specs.len());
        for spec in specs {
            let resolution = self
                .resolver
                .resolve(&slug, &spec)
                .await
                .map_err(PipelineError::Catalog)?;
            artifacts.push(match resolution {
                ViewResolution::Resolved { config_ref } => {
                    ViewArtifact::resolved(slug.clone(), spec, config_ref)
                }
                ViewResolution::Unresolved { reason } => {
                    debug!(variant = spec.variant_index, %reason, "variant unresolved");
                    ViewArtifact::unresolved(slug.clone(), spec, reason)
                }
            });
        }

        if guard.check(Checkpoint::BeforePersist).await? == Staleness::Superseded {
            return Ok(superseded(Checkpoint::BeforePersist));
        }
        self.artifacts.replace_for_source(&slug, &artifacts).await?;

        // Phase 2: publish.
        if guard.check(Checkpoint::BeforePublish).await? == Staleness::Superseded {
            return Ok(superseded(Checkpoint::BeforePublish));
        }
        self.publisher.publish(&slug, &artifacts).await?;

        if guard.mark_clean().await? == Staleness::Superseded {
            return Ok(superseded(Checkpoint::AfterPublish));
        }

        let resolved = artifacts.iter().filter(|a| a.is_resolved()).count();
        let summary = RefreshSummary {
            slug,
            variants: artifacts.len(),
            resolved,
            unresolved: artifacts.len() - resolved,
        };
        info!(
            variants = summary.variants,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            "views refreshed"
        );
        Ok(PipelineOutcome::Completed(summary))
    }
}

fn superseded(checkpoint: Checkpoint) -> PipelineOutcome {
    info!(checkpoint = %checkpoint, "refresh superseded by a newer edit");
    PipelineOutcome::Superseded { checkpoint }
}
