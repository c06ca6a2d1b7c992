//! Persisted view artifacts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use viewforge_core::{SourceSlug, ViewArtifact};

use crate::error::StoreError;

/// Storage for the artifact set of each source.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Replace every artifact of `slug` with `artifacts` in one atomic write.
    /// Running it twice with the same input leaves the same rows.
    async fn replace_for_source(
        &self,
        slug: &SourceSlug,
        artifacts: &[ViewArtifact],
    ) -> Result<(), StoreError>;

    /// Artifacts of `slug` ordered by variant index.
    async fn list_for_source(&self, slug: &SourceSlug) -> Result<Vec<ViewArtifact>, StoreError>;
}

#[async_trait::async_trait]
impl<S> ArtifactStore for Arc<S>
where
    S: ArtifactStore + ?Sized,
{
    async fn replace_for_source(
        &self,
        slug: &SourceSlug,
        artifacts: &[ViewArtifact],
    ) -> Result<(), StoreError> {
        (**self).replace_for_source(slug, artifacts).await
    }

    async fn list_for_source(&self, slug: &SourceSlug) -> Result<Vec<ViewArtifact>, StoreError> {
        (**self).list_for_source(slug).await
    }
}

/// In-memory artifact store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: Mutex<HashMap<SourceSlug, Vec<ViewArtifact>>>,
    writes: Mutex<u64>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceSlug, Vec<ViewArtifact>>> {
        self.artifacts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `replace_for_source` calls so far.
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn replace_for_source(
        &self,
        slug: &SourceSlug,
        artifacts: &[ViewArtifact],
    ) -> Result<(), StoreError> {
        if let Some(foreign) = artifacts.iter().find(|a| &a.source_slug != slug) {
            return Err(StoreError::Conflict(format!(
                "artifact for {} written under {}",
                foreign.source_slug, slug
            )));
        }

        let mut rows = artifacts.to_vec();
        rows.sort_by_key(|a| a.variant_index);
        rows.dedup_by_key(|a| a.variant_index);
        self.lock().insert(slug.clone(), rows);
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }

    async fn list_for_source(&self, slug: &SourceSlug) -> Result<Vec<ViewArtifact>, StoreError> {
        Ok(self.lock().get(slug).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewforge_core::ViewSpec;

    fn slug(s: &str) -> SourceSlug {
        SourceSlug::new(s).unwrap()
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_set() {
        let store = InMemoryArtifactStore::new();
        let a = slug("a");

        store
            .replace_for_source(
                &a,
                &[
                    ViewArtifact::resolved(a.clone(), ViewSpec::new(1), "r1"),
                    ViewArtifact::resolved(a.clone(), ViewSpec::new(0), "r0"),
                    ViewArtifact::unresolved(a.clone(), ViewSpec::new(2), "bad"),
                ],
            )
            .await
            .unwrap();
        let listed = store.list_for_source(&a).await.unwrap();
        assert_eq!(
            listed.iter().map(|r| r.variant_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        store
            .replace_for_source(&a, &[ViewArtifact::resolved(a.clone(), ViewSpec::new(0), "r0")])
            .await
            .unwrap();
        assert_eq!(store.list_for_source(&a).await.unwrap().len(), 1);
        assert!(store.list_for_source(&slug("b")).await.unwrap().is_empty());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn rejects_artifacts_of_another_source() {
        let store = InMemoryArtifactStore::new();
        let err = store
            .replace_for_source(
                &slug("a"),
                &[ViewArtifact::resolved(slug("b"), ViewSpec::new(0), "r")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
