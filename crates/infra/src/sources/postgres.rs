//! Postgres-backed source store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use viewforge_core::{DomainError, RefreshStatus, Source, SourceSlug};

use crate::error::{StoreError, map_sqlx_error};

use super::SourceStore;

/// `sources` table access.
#[derive(Debug, Clone)]
pub struct PostgresSourceStore {
    pool: Arc<PgPool>,
}

impl PostgresSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Insert a source or replace its configuration, moving `updated_at`
    /// forward as an edit does.
    #[instrument(skip(self, config), fields(slug = %slug), err)]
    pub async fn upsert(
        &self,
        slug: &SourceSlug,
        config: &serde_json::Value,
    ) -> Result<Source, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (slug, config, updated_at, refresh_status)
            VALUES ($1, $2, clock_timestamp(), 'clean')
            ON CONFLICT (slug) DO UPDATE
            SET config = EXCLUDED.config,
                updated_at = GREATEST(clock_timestamp(), sources.updated_at + interval '1 microsecond')
            RETURNING slug, config, updated_at, refresh_status
            "#,
        )
        .bind(slug.as_str())
        .bind(config)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_source", e))?;
        source_from_row(&row)
    }
}

#[async_trait::async_trait]
impl SourceStore for PostgresSourceStore {
    #[instrument(skip(self), fields(slug = %slug), err)]
    async fn get(&self, slug: &SourceSlug) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(
            "SELECT slug, config, updated_at, refresh_status FROM sources WHERE slug = $1",
        )
        .bind(slug.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_source", e))?;
        row.as_ref().map(source_from_row).transpose()
    }

    #[instrument(skip(self), fields(slug = %slug, status = %status), err)]
    async fn set_refresh_status(
        &self,
        slug: &SourceSlug,
        status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sources SET refresh_status = $2 WHERE slug = $1")
            .bind(slug.as_str())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_refresh_status", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(slug = %slug), err)]
    async fn mark_clean_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sources SET refresh_status = 'clean' WHERE slug = $1 AND updated_at = $2",
        )
        .bind(slug.as_str())
        .bind(expected_updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_clean_if_unchanged", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(slug = %slug, expected_status = %expected_status), err)]
    async fn mark_failed_if_unchanged(
        &self,
        slug: &SourceSlug,
        expected_updated_at: DateTime<Utc>,
        expected_status: RefreshStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET refresh_status = 'failed'
            WHERE slug = $1 AND updated_at = $2 AND refresh_status = $3
            "#,
        )
        .bind(slug.as_str())
        .bind(expected_updated_at)
        .bind(expected_status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_if_unchanged", e))?;
        Ok(result.rows_affected() > 0)
    }
}

fn source_from_row(row: &PgRow) -> Result<Source, StoreError> {
    let decode = |e| map_sqlx_error("decode_source", e);
    let slug: String = row.try_get("slug").map_err(decode)?;
    let status: String = row.try_get("refresh_status").map_err(decode)?;
    let invalid = |e: DomainError| StoreError::Serialization(e.to_string());

    Ok(Source {
        slug: SourceSlug::new(slug).map_err(invalid)?,
        config: row.try_get("config").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        refresh_status: status.parse().map_err(invalid)?,
    })
}
