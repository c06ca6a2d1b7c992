//! View definitions and the artifacts computed from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::SourceSlug;

/// One variant described by a source configuration.
///
/// `variant_index` is the position of the variant in the source document and,
/// together with the source slug, the key of the artifact row it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub variant_index: u32,
    /// Dimension choices selecting this variant (e.g. `metric = "deaths"`).
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    /// IDs of the external records this variant draws from.
    #[serde(default)]
    pub dependency_ids: Vec<String>,
}

impl ViewSpec {
    pub fn new(variant_index: u32) -> Self {
        Self {
            variant_index,
            dimensions: BTreeMap::new(),
            dependency_ids: Vec::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, choice: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), choice.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependency_ids.push(id.into());
        self
    }

    /// Content fingerprint of this variant within `slug`.
    ///
    /// Stable across processes and releases: it is derived only from the slug,
    /// the variant index, the dimension choices (in key order) and the
    /// dependency IDs (in document order).
    pub fn fingerprint(&self, slug: &SourceSlug) -> String {
        let mut hasher = Sha256::new();
        hasher.update(slug.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.variant_index.to_be_bytes());
        for (name, choice) in &self.dimensions {
            hasher.update([1u8]);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(choice.as_bytes());
        }
        for id in &self.dependency_ids {
            hasher.update([2u8]);
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Persisted result of resolving one [`ViewSpec`].
///
/// Exactly one of `config_ref` and `error` is set. A populated `error` is a
/// per-variant outcome recorded as data; it does not fail the refresh job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewArtifact {
    pub source_slug: SourceSlug,
    pub variant_index: u32,
    pub spec: ViewSpec,
    pub config_ref: Option<String>,
    pub error: Option<String>,
}

impl ViewArtifact {
    pub fn resolved(source_slug: SourceSlug, spec: ViewSpec, config_ref: impl Into<String>) -> Self {
        Self {
            source_slug,
            variant_index: spec.variant_index,
            spec,
            config_ref: Some(config_ref.into()),
            error: None,
        }
    }

    pub fn unresolved(source_slug: SourceSlug, spec: ViewSpec, error: impl Into<String>) -> Self {
        Self {
            source_slug,
            variant_index: spec.variant_index,
            spec,
            config_ref: None,
            error: Some(error.into()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.config_ref.is_some()
    }
}
