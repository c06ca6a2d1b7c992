//! Postgres-backed job store.
//!
//! Each state transition is one statement (or, for the sweep, one
//! transaction). The partial unique indexes `jobs_one_queued_per_key` and
//! `jobs_one_processing_per_key` back the per-key invariants, so a race the
//! statements' own predicates miss surfaces as a unique violation instead of
//! a second queued or processing row.
//!
//! SQLx errors go through the shared `map_sqlx_error` and convert into
//! [`JobStoreError`], so a unique violation arrives as `Conflict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, debug, instrument};

use crate::error::map_sqlx_error;

use super::store::{
    JobQuery, JobStats, JobStore, JobStoreError, ReclaimDisposition, Reclaimed, RequeueResult,
    UpsertResult,
};
use super::types::{Job, JobId, JobState, JobType, superseded_after_failure};

const JOB_COLUMNS: &str = "id, job_type, job_key, payload, state, attempts, last_error, \
                           created_at, updated_at, claimed_at, scheduled_at";

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish "claim lost" from "no such job" after a guarded write hit
    /// zero rows.
    async fn lost_claim(&self, id: JobId) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(_)) => JobStoreError::LostClaim(id),
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn fold_into_sibling(
        &self,
        job: &Job,
        error: &str,
    ) -> Result<RequeueResult, JobStoreError> {
        let folded = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'done', last_error = $3, updated_at = now()
            WHERE id = $1 AND state = 'processing' AND attempts = $2
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.attempts as i32)
        .bind(superseded_after_failure(error))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fold_job", e))?;

        if folded.is_none() {
            return Err(self.lost_claim(job.id).await);
        }

        let sibling = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE job_type = $1 AND job_key = $2 AND id <> $3
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(&job.key)
        .bind(job.id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_sibling", e))?
        .ok_or_else(|| JobStoreError::Conflict(format!("job {} folded without a sibling", job.id)))?;

        let into: uuid::Uuid = sibling
            .try_get("id")
            .map_err(|e| map_sqlx_error("find_sibling", e))?;
        Ok(RequeueResult::Folded {
            into: JobId::from_uuid(into),
        })
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, payload), fields(job_type = %job_type, key = %key, job_id = tracing::field::Empty), err)]
    async fn upsert_queued(
        &self,
        job_type: JobType,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<UpsertResult, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, job_key, payload, state, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, now(), now())
            ON CONFLICT (job_type, job_key) WHERE state = 'queued'
            DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(JobId::new().as_uuid())
        .bind(job_type.as_str())
        .bind(key)
        .bind(&payload)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_queued", e))?;

        let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("upsert_queued", e))?;
        let inserted: bool = row
            .try_get("inserted")
            .map_err(|e| map_sqlx_error("upsert_queued", e))?;
        let id = JobId::from_uuid(id);
        Span::current().record("job_id", tracing::field::display(id));

        Ok(if inserted {
            UpsertResult::Inserted(id)
        } else {
            UpsertResult::Coalesced(id)
        })
    }

    #[instrument(skip(self), fields(job_type = %job_type), err)]
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                attempts = attempts + 1,
                claimed_at = now(),
                updated_at = now()
            WHERE id = (
                SELECT q.id FROM jobs q
                WHERE q.job_type = $1
                  AND q.state = 'queued'
                  AND (q.scheduled_at IS NULL OR q.scheduled_at <= now())
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs p
                      WHERE p.job_type = q.job_type
                        AND p.job_key = q.job_key
                        AND p.state = 'processing'
                  )
                ORDER BY q.created_at, q.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND state = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        );

        match sqlx::query(&sql)
            .bind(job_type.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| JobStoreError::from(map_sqlx_error("claim_next", e)))
        {
            Ok(row) => row.as_ref().map(job_from_row).transpose(),
            // Another worker claimed the same key between our check and write.
            Err(JobStoreError::Conflict(msg)) => {
                debug!(reason = %msg, "claim raced with another worker");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempts), err)]
    async fn complete(&self, job: &Job, note: Option<&str>) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'done', last_error = COALESCE($3, last_error), updated_at = now()
            WHERE id = $1 AND state = 'processing' AND attempts = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.attempts as i32)
            .bind(note)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.lost_claim(job.id).await),
        }
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempt = job.attempts), err)]
    async fn requeue(
        &self,
        job: &Job,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RequeueResult, JobStoreError> {
        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued',
                last_error = $3,
                scheduled_at = $4,
                claimed_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'processing' AND attempts = $2
              AND NOT EXISTS (
                  SELECT 1 FROM jobs s
                  WHERE s.job_type = jobs.job_type
                    AND s.job_key = jobs.job_key
                    AND s.state = 'queued'
              )
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.attempts as i32)
        .bind(error)
        .bind(retry_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| JobStoreError::from(map_sqlx_error("requeue", e)));

        match requeued {
            Ok(Some(_)) => Ok(RequeueResult::Requeued { retry_at }),
            // Either a queued sibling exists or the claim is gone; the fold
            // statement tells them apart.
            Ok(None) | Err(JobStoreError::Conflict(_)) => self.fold_into_sibling(job, error).await,
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempt = job.attempts), err)]
    async fn fail(&self, job: &Job, error: &str) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'failed', last_error = $3, updated_at = now()
            WHERE id = $1 AND state = 'processing' AND attempts = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.attempts as i32)
            .bind(error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.lost_claim(job.id).await),
        }
    }

    #[instrument(skip(self), fields(job_type = %job_type, reclaimed = tracing::field::Empty), err)]
    async fn reclaim_expired(
        &self,
        job_type: JobType,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Reclaimed>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let expired = sqlx::query(
            r#"
            SELECT id, job_key, attempts FROM jobs
            WHERE job_type = $1 AND state = 'processing' AND claimed_at < $2
            ORDER BY claimed_at, id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_type.as_str())
        .bind(claimed_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_expired", e))?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for row in expired {
            let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("select_expired", e))?;
            let key: String = row
                .try_get("job_key")
                .map_err(|e| map_sqlx_error("select_expired", e))?;
            let attempts: i32 = row
                .try_get("attempts")
                .map_err(|e| map_sqlx_error("select_expired", e))?;

            let has_sibling = sqlx::query(
                "SELECT 1 FROM jobs WHERE job_type = $1 AND job_key = $2 AND state = 'queued'",
            )
            .bind(job_type.as_str())
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_sibling", e))?
            .is_some();

            let (disposition, set_clause, last_error) = if attempts as u32 >= max_attempts {
                (
                    ReclaimDisposition::Failed,
                    "state = 'failed'",
                    "claim expired after final attempt".to_string(),
                )
            } else if has_sibling {
                (
                    ReclaimDisposition::Superseded,
                    "state = 'done'",
                    superseded_after_failure("claim expired"),
                )
            } else {
                (
                    ReclaimDisposition::Requeued,
                    "state = 'queued', claimed_at = NULL, scheduled_at = now()",
                    "claim expired".to_string(),
                )
            };

            let sql = format!(
                "UPDATE jobs SET {set_clause}, last_error = $2, updated_at = now() \
                 WHERE id = $1 RETURNING {JOB_COLUMNS}"
            );
            let updated = sqlx::query(&sql)
                .bind(id)
                .bind(last_error)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("reclaim_job", e))?;

            reclaimed.push(Reclaimed {
                job: job_from_row(&updated)?,
                disposition,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("reclaimed", reclaimed.len());
        Ok(reclaimed)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::TEXT IS NULL OR job_type = $1)
              AND ($2::TEXT IS NULL OR state = $2)
              AND ($3::TEXT IS NULL OR job_key = $3)
            ORDER BY created_at, id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.job_type.map(JobType::as_str))
            .bind(query.state.map(JobState::as_str))
            .bind(query.key.as_deref())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_type = %job_type), err)]
    async fn stats(&self, job_type: JobType) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM jobs WHERE job_type = $1 GROUP BY state",
        )
        .bind(job_type.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let count = count as usize;
            match parse_state(&state)? {
                JobState::Queued => stats.queued = count,
                JobState::Processing => stats.processing = count,
                JobState::Done => stats.done = count,
                JobState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

fn parse_state(value: &str) -> Result<JobState, JobStoreError> {
    value
        .parse()
        .map_err(|e: viewforge_core::DomainError| JobStoreError::Serialization(e.to_string()))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e| map_sqlx_error("decode_job", e);

    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let state: String = row.try_get("state").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        job_type: job_type
            .parse()
            .map_err(|e: viewforge_core::DomainError| JobStoreError::Serialization(e.to_string()))?,
        key: row.try_get("job_key").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        state: parse_state(&state)?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        claimed_at: row.try_get("claimed_at").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
    })
}
