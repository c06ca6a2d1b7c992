//! `viewforge-core`: domain building blocks for view refreshes.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod parser;
pub mod source;
pub mod view;

pub use error::{DomainError, DomainResult};
pub use id::SourceSlug;
pub use parser::parse_view_specs;
pub use source::{RefreshStatus, Source};
pub use view::{ViewArtifact, ViewSpec};
