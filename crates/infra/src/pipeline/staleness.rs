//! Detects that a source changed after a refresh started.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use viewforge_core::{Source, SourceSlug};

use crate::error::StoreError;
use crate::sources::SourceStore;

/// Where in the pipeline a staleness check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// After Phase 1 computed its artifacts, before they are written.
    BeforePersist,
    /// Between Phase 1 and Phase 2.
    BeforePublish,
    /// The conditional `clean` write after Phase 2.
    AfterPublish,
}

impl Checkpoint {
    pub const fn as_str(self) -> &'static str {
        match self {
            Checkpoint::BeforePersist => "before_persist",
            Checkpoint::BeforePublish => "before_publish",
            Checkpoint::AfterPublish => "after_publish",
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The source clock observed when the refresh read its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSnapshot {
    pub slug: SourceSlug,
    pub updated_at: DateTime<Utc>,
}

impl ClaimSnapshot {
    pub fn of(source: &Source) -> Self {
        Self {
            slug: source.slug.clone(),
            updated_at: source.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Superseded,
}

/// Compares the live source against a [`ClaimSnapshot`].
#[derive(Clone)]
pub struct StalenessGuard {
    sources: Arc<dyn SourceStore>,
    snapshot: ClaimSnapshot,
}

impl StalenessGuard {
    pub fn new(sources: Arc<dyn SourceStore>, snapshot: ClaimSnapshot) -> Self {
        Self { sources, snapshot }
    }

    pub fn snapshot(&self) -> &ClaimSnapshot {
        &self.snapshot
    }

    /// A source that disappeared counts as superseded.
    pub async fn check(&self, checkpoint: Checkpoint) -> Result<Staleness, StoreError> {
        let current = self.sources.get(&self.snapshot.slug).await?;
        let staleness = match current {
            Some(source) if source.updated_at == self.snapshot.updated_at => Staleness::Fresh,
            _ => Staleness::Superseded,
        };
        debug!(
            slug = %self.snapshot.slug,
            checkpoint = %checkpoint,
            fresh = staleness == Staleness::Fresh,
            "staleness check"
        );
        Ok(staleness)
    }

    /// Final check fused with the `clean` write, so no edit can land between
    /// them.
    pub async fn mark_clean(&self) -> Result<Staleness, StoreError> {
        let written = self
            .sources
            .mark_clean_if_unchanged(&self.snapshot.slug, self.snapshot.updated_at)
            .await?;
        Ok(if written {
            Staleness::Fresh
        } else {
            Staleness::Superseded
        })
    }
}
