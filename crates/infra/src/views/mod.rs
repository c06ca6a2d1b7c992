//! View variants: parsing, resolution and artifact storage.

mod artifacts;
mod postgres;
mod resolver;

pub use artifacts::{ArtifactStore, InMemoryArtifactStore};
pub use postgres::{PostgresArtifactStore, PostgresDependencyCatalog};
pub use resolver::{
    CatalogResolver, DependencyCatalog, InMemoryDependencyCatalog, JsonViewSpecParser,
    ViewResolution, ViewResolver, ViewSpecParser,
};
