//! Infrastructure layer: job queue, refresh pipeline, stores, publishers.

pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod publish;
pub mod schema;
pub mod sources;
pub mod views;


pub use config::{ConfigError, RefreshConfig};
pub use error::StoreError;
