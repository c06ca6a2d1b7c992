//! Database schema.

use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::{StoreError, map_sqlx_error};

/// Schema for sources, jobs, artifacts and the dependency catalog.
pub const MIGRATION_0001: &str = include_str!("../migrations/0001_refresh_jobs.sql");

/// Create every table and index if missing. Safe to run repeatedly.
#[instrument(skip(pool), err)]
pub async fn apply(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(MIGRATION_0001)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    info!(migration = "0001_refresh_jobs", "schema applied");
    Ok(())
}
