//! Postgres-backed artifact store and dependency catalog.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use viewforge_core::{SourceSlug, ViewArtifact, ViewSpec};

use crate::error::{StoreError, map_sqlx_error};

use super::artifacts::ArtifactStore;
use super::resolver::DependencyCatalog;

/// `view_artifacts` table access.
#[derive(Debug, Clone)]
pub struct PostgresArtifactStore {
    pool: Arc<PgPool>,
}

impl PostgresArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for PostgresArtifactStore {
    /// Delete-then-insert inside one transaction, so readers never see a
    /// partially replaced set.
    #[instrument(skip(self, artifacts), fields(slug = %slug, artifact_count = artifacts.len()), err)]
    async fn replace_for_source(
        &self,
        slug: &SourceSlug,
        artifacts: &[ViewArtifact],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM view_artifacts WHERE source_slug = $1")
            .bind(slug.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_artifacts", e))?;

        for artifact in artifacts {
            if &artifact.source_slug != slug {
                return Err(StoreError::Conflict(format!(
                    "artifact for {} written under {}",
                    artifact.source_slug, slug
                )));
            }
            let spec = serde_json::to_value(&artifact.spec)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO view_artifacts (source_slug, variant_index, spec, config_ref, error)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_slug, variant_index) DO UPDATE
                SET spec = EXCLUDED.spec, config_ref = EXCLUDED.config_ref, error = EXCLUDED.error
                "#,
            )
            .bind(slug.as_str())
            .bind(artifact.variant_index as i32)
            .bind(spec)
            .bind(artifact.config_ref.as_deref())
            .bind(artifact.error.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_artifact", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(slug = %slug, artifact_count = tracing::field::Empty), err)]
    async fn list_for_source(&self, slug: &SourceSlug) -> Result<Vec<ViewArtifact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT variant_index, spec, config_ref, error
            FROM view_artifacts
            WHERE source_slug = $1
            ORDER BY variant_index ASC
            "#,
        )
        .bind(slug.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_artifacts", e))?;

        let mut artifacts = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |e| map_sqlx_error("decode_artifact", e);
            let variant_index: i32 = row.try_get("variant_index").map_err(decode)?;
            let spec: serde_json::Value = row.try_get("spec").map_err(decode)?;
            let spec: ViewSpec =
                serde_json::from_value(spec).map_err(|e| StoreError::Serialization(e.to_string()))?;
            artifacts.push(ViewArtifact {
                source_slug: slug.clone(),
                variant_index: variant_index.max(0) as u32,
                spec,
                config_ref: row.try_get("config_ref").map_err(decode)?,
                error: row.try_get("error").map_err(decode)?,
            });
        }

        Span::current().record("artifact_count", artifacts.len());
        Ok(artifacts)
    }
}

/// Dependency catalog backed by the `view_dependencies` table.
#[derive(Debug, Clone)]
pub struct PostgresDependencyCatalog {
    pool: Arc<PgPool>,
}

impl PostgresDependencyCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Register a dependency record. Existing IDs keep their label.
    #[instrument(skip(self), err)]
    pub async fn register(&self, id: &str, label: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO view_dependencies (id, label) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(label)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_dependency", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DependencyCatalog for PostgresDependencyCatalog {
    #[instrument(skip(self, ids), fields(id_count = ids.len()), err)]
    async fn missing(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM view_dependencies WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("lookup_dependencies", e))?;

        let mut known = std::collections::HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("lookup_dependencies", e))?;
            known.insert(id);
        }
        Ok(ids.iter().filter(|id| !known.contains(*id)).cloned().collect())
    }
}
