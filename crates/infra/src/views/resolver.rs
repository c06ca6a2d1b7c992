//! Turning source configurations into resolved view variants.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use viewforge_core::{DomainResult, SourceSlug, ViewSpec, parse_view_specs};

use crate::error::StoreError;

/// Parses a source configuration into its view variants.
pub trait ViewSpecParser: Send + Sync {
    /// Fails only when the document as a whole is unusable.
    fn parse(&self, config: &Value) -> DomainResult<Vec<ViewSpec>>;
}

/// Parser for the `{"views": [...]}` document shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonViewSpecParser;

impl ViewSpecParser for JsonViewSpecParser {
    fn parse(&self, config: &Value) -> DomainResult<Vec<ViewSpec>> {
        parse_view_specs(config)
    }
}

/// Per-variant resolution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewResolution {
    Resolved { config_ref: String },
    /// The variant cannot be built; recorded on its artifact.
    Unresolved { reason: String },
}

/// Resolves one view variant.
///
/// `Err` means the resolver itself could not run (e.g. its backing store is
/// unreachable) and fails the whole refresh attempt.
#[async_trait::async_trait]
pub trait ViewResolver: Send + Sync {
    async fn resolve(&self, slug: &SourceSlug, spec: &ViewSpec) -> Result<ViewResolution, StoreError>;
}

#[async_trait::async_trait]
impl<R> ViewResolver for Arc<R>
where
    R: ViewResolver + ?Sized,
{
    async fn resolve(&self, slug: &SourceSlug, spec: &ViewSpec) -> Result<ViewResolution, StoreError> {
        (**self).resolve(slug, spec).await
    }
}

/// Lookup of the external records view variants depend on.
#[async_trait::async_trait]
pub trait DependencyCatalog: Send + Sync {
    /// The subset of `ids` the catalog does not know, in input order.
    async fn missing(&self, ids: &[String]) -> Result<Vec<String>, StoreError>;
}

#[async_trait::async_trait]
impl<C> DependencyCatalog for Arc<C>
where
    C: DependencyCatalog + ?Sized,
{
    async fn missing(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        (**self).missing(ids).await
    }
}

/// In-memory dependency catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDependencyCatalog {
    ids: RwLock<HashSet<String>>,
}

impl InMemoryDependencyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, id: impl Into<String>) {
        self.ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.into());
    }

    pub fn remove(&self, id: &str) {
        self.ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }
}

#[async_trait::async_trait]
impl DependencyCatalog for InMemoryDependencyCatalog {
    async fn missing(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let known = self.ids.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(ids.iter().filter(|id| !known.contains(*id)).cloned().collect())
    }
}

/// Resolves a variant iff every dependency it names exists in the catalog.
///
/// The `config_ref` of a resolved variant is its content fingerprint, so
/// resolving the same spec twice yields the same reference.
#[derive(Debug, Clone)]
pub struct CatalogResolver<C> {
    catalog: C,
}

impl<C: DependencyCatalog> CatalogResolver<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }
}

#[async_trait::async_trait]
impl<C: DependencyCatalog> ViewResolver for CatalogResolver<C> {
    async fn resolve(&self, slug: &SourceSlug, spec: &ViewSpec) -> Result<ViewResolution, StoreError> {
        if spec.dependency_ids.is_empty() {
            return Ok(ViewResolution::Resolved {
                config_ref: spec.fingerprint(slug),
            });
        }

        let missing = self.catalog.missing(&spec.dependency_ids).await?;
        Ok(if missing.is_empty() {
            ViewResolution::Resolved {
                config_ref: spec.fingerprint(slug),
            }
        } else {
            ViewResolution::Unresolved {
                reason: format!("unknown dependency ids: {}", missing.join(", ")),
            }
        })
    }
}
