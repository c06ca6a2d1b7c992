//! Source documents and their refresh status.
//!
//! Sources are edited elsewhere; the refresh machinery only reads them and
//! writes `refresh_status`. Status writes never move `updated_at`.

mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use viewforge_core::{RefreshStatus, Source, SourceSlug};

use crate::error::StoreError;

pub use postgres::PostgresSourceStore;

/// Read access to sources plus the status writes a refresh needs.
#[async_trait::async_trait]
pub trait SourceStore: Send + Sync {
    /// Load a source. Configuration and `updated_at` come from the same read.
    async fn get(&self, slug: &SourceSlug) -> Result<Option<Source>, StoreError>;

    /// Set `refresh_status`. Returns `false` if the source does not exist.
    async fn set_refresh_status(
        &self,
        slug: &SourceSlug,
        status: RefreshStatus,
    ) -> Result<bool, StoreError>;

    /// Atomically set `refresh_status = clean` iff `updated_at` still equals
    /// `expected_updated_at`. Returns whether the write happened.
    async fn mark_clean_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically set `refresh_status = failed` iff both `updated_at` and
    /// `refresh_status` still hold the values the caller read. A newer run
    /// that already moved the status on is left alone.
    async fn mark_failed_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
        expected_status: RefreshStatus,
    ) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
impl<S> SourceStore for Arc<S>
where
    S: SourceStore + ?Sized,
{
    async fn get(&self, slug: &SourceSlug) -> Result<Option<Source>, StoreError> {
        (**self).get(slug).await
    }

    async fn set_refresh_status(
        &self,
        slug: &SourceSlug,
        status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        (**self).set_refresh_status(slug, status).await
    }

    async fn mark_clean_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).mark_clean_if_unchanged(slug, expected_updated_at).await
    }

    async fn mark_failed_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
        expected_status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        (**self)
            .mark_failed_if_unchanged(slug, expected_updated_at, expected_status)
            .await
    }
}

/// In-memory source store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySourceStore {
    sources: Mutex<HashMap<SourceSlug, Source>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceSlug, Source>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a source, or replace its configuration as an edit would.
    pub fn upsert(&self, slug: SourceSlug, config: serde_json::Value) -> Source {
        let mut sources = self.lock();
        match sources.get_mut(&slug) {
            Some(existing) => {
                existing.config = config;
                existing.updated_at = next_tick(existing.updated_at);
                existing.clone()
            }
            None => {
                let source = Source::new(slug.clone(), config);
                sources.insert(slug, source.clone());
                source
            }
        }
    }

    /// Record an edit without changing the configuration.
    pub fn touch(&self, slug: &SourceSlug) -> Option<DateTime<Utc>> {
        let mut sources = self.lock();
        let source = sources.get_mut(slug)?;
        source.updated_at = next_tick(source.updated_at);
        Some(source.updated_at)
    }

    pub fn snapshot(&self, slug: &SourceSlug) -> Option<Source> {
        self.lock().get(slug).cloned()
    }
}

/// A strictly later timestamp at the precision Postgres stores.
fn next_tick(previous: DateTime<Utc>) -> DateTime<Utc> {
    let bumped = previous + chrono::Duration::microseconds(1);
    Utc::now().max(bumped)
}

#[async_trait::async_trait]
impl SourceStore for InMemorySourceStore {
    async fn get(&self, slug: &SourceSlug) -> Result<Option<Source>, StoreError> {
        Ok(self.snapshot(slug))
    }

    async fn set_refresh_status(
        &self,
        slug: &SourceSlug,
        status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        let mut sources = self.lock();
        Ok(match sources.get_mut(slug) {
            Some(source) => {
                source.refresh_status = status;
                true
            }
            None => false,
        })
    }

    async fn mark_clean_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut sources = self.lock();
        Ok(match sources.get_mut(slug) {
            Some(source) if source.updated_at == expected_updated_at => {
                source.refresh_status = RefreshStatus::Clean;
                true
            }
            _ => false,
        })
    }

    async fn mark_failed_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
        expected_status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        let mut sources = self.lock();
        Ok(match sources.get_mut(slug) {
            Some(source)
                if source.updated_at == expected_updated_at
                    && source.refresh_status == expected_status =>
            {
                source.refresh_status = RefreshStatus::Failed;
                true
            }
            _ => false,
        })
    }
}
