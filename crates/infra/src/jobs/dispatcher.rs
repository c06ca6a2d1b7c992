//! One step of the worker loop: claim a job, run it, persist the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use viewforge_core::{RefreshStatus, SourceSlug};

use crate::error::StoreError;
use crate::pipeline::{Checkpoint, PipelineOutcome, RefreshPipeline, RefreshSummary};

use super::retry::{FailureDisposition, RetryController};
use super::store::{JobQuery, JobStore, JobStoreError, ReclaimDisposition, Reclaimed};
use super::types::{Job, JobId, JobState, JobType, SUPERSEDED_MESSAGE};

/// `last_error` of a job whose source was deleted before it ran.
pub const SOURCE_MISSING_MESSAGE: &str = "source no longer exists";

/// Final result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(RefreshSummary),
    /// The source changed mid-run; the job is `done` and a newer job redoes it.
    Superseded { checkpoint: Checkpoint },
    SourceMissing,
    /// The attempt failed and the job is queued again.
    Retrying { attempt: u32, retry_at: DateTime<Utc> },
    /// The attempt failed and a newer queued job absorbed it.
    Folded { into: JobId },
    Failed { error: String },
    /// The claim expired and was reclaimed before the outcome could be
    /// written; nothing was recorded.
    ClaimLost,
}

impl JobOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded(_) => "succeeded",
            JobOutcome::Superseded { .. } => "superseded",
            JobOutcome::SourceMissing => "source_missing",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::Folded { .. } => "folded",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::ClaimLost => "claim_lost",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job store: {0}")]
    Jobs(#[from] JobStoreError),
    #[error("source store: {0}")]
    Sources(#[from] StoreError),
}

/// Claims and executes jobs of one type.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    pipeline: RefreshPipeline,
    retry: RetryController,
    job_type: JobType,
}

impl Dispatcher {
    pub fn new(jobs: Arc<dyn JobStore>, pipeline: RefreshPipeline, retry: RetryController) -> Self {
        Self {
            jobs,
            pipeline,
            retry,
            job_type: JobType::RefreshViews,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Atomically claim the oldest claimable job of `job_type`.
    pub async fn claim_next_queued_job(&self, job_type: JobType) -> Result<Option<Job>, DispatchError> {
        Ok(self.jobs.claim_next(job_type).await?)
    }

    /// Run a claimed job and persist its outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, slug = %job.key, attempt = job.attempts), err)]
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome, DispatchError> {
        let written = match self.pipeline.run(&job).await {
            Ok(PipelineOutcome::Completed(summary)) => self
                .jobs
                .complete(&job, None)
                .await
                .map(|_| JobOutcome::Succeeded(summary)),
            Ok(PipelineOutcome::Superseded { checkpoint }) => self
                .jobs
                .complete(&job, Some(SUPERSEDED_MESSAGE))
                .await
                .map(|_| JobOutcome::Superseded { checkpoint }),
            Ok(PipelineOutcome::SourceMissing) => self
                .jobs
                .complete(&job, Some(SOURCE_MISSING_MESSAGE))
                .await
                .map(|_| JobOutcome::SourceMissing),
            Err(error) => match self.retry.handle_failure(self.jobs.as_ref(), &job, &error).await {
                Ok(FailureDisposition::Requeued { retry_at }) => Ok(JobOutcome::Retrying {
                    attempt: job.attempts,
                    retry_at,
                }),
                Ok(FailureDisposition::Folded { into }) => Ok(JobOutcome::Folded { into }),
                Ok(FailureDisposition::Failed) => {
                    self.mark_source_failed(&job.key).await?;
                    Ok(JobOutcome::Failed {
                        error: error.to_string(),
                    })
                }
                Err(e) => Err(e),
            },
        };

        let outcome = match written {
            Ok(outcome) => outcome,
            Err(JobStoreError::LostClaim(id)) => {
                warn!(job_id = %id, "claim was reclaimed while the job ran; outcome discarded");
                JobOutcome::ClaimLost
            }
            Err(e) => return Err(e.into()),
        };

        info!(outcome = outcome.as_str(), "job processed");
        Ok(outcome)
    }

    /// Claim and process one job. `None` when nothing was claimable.
    pub async fn process_one_queued_job(&self, job_type: JobType) -> Result<Option<JobOutcome>, DispatchError> {
        match self.claim_next_queued_job(job_type).await? {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Recover jobs whose claim is older than `claim_timeout`.
    #[instrument(skip(self), fields(job_type = %self.job_type), err)]
    pub async fn reclaim_abandoned(&self, claim_timeout: Duration) -> Result<Vec<Reclaimed>, DispatchError> {
        let timeout = chrono::Duration::from_std(claim_timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self
            .jobs
            .reclaim_expired(self.job_type, cutoff, self.retry.policy().max_attempts)
            .await?;

        for entry in &reclaimed {
            warn!(
                job_id = %entry.job.id,
                slug = %entry.job.key,
                attempt = entry.job.attempts,
                disposition = ?entry.disposition,
                "reclaimed abandoned job"
            );
            if entry.disposition == ReclaimDisposition::Failed {
                self.mark_source_failed(&entry.job.key).await?;
            }
        }
        Ok(reclaimed)
    }

    /// Record a final failure on the source unless something newer owns its
    /// status.
    ///
    /// The job row has already left `processing`, so a follow-up job for the
    /// same key may have run to completion. The status read here is only
    /// overwritten if it is still current when the write lands.
    async fn mark_source_failed(&self, key: &str) -> Result<bool, DispatchError> {
        // A key that is not a valid slug never named a source.
        let Ok(slug) = SourceSlug::new(key) else {
            return Ok(false);
        };
        let follow_ups = self
            .jobs
            .find(&JobQuery::for_key(self.job_type, key).with_state(JobState::Queued))
            .await?;
        if !follow_ups.is_empty() {
            debug!(slug = %slug, "follow-up job queued; leaving source status to it");
            return Ok(false);
        }

        let sources = self.pipeline.sources();
        let Some(current) = sources.get(&slug).await? else {
            return Ok(false);
        };
        if !matches!(
            current.refresh_status,
            RefreshStatus::Pending | RefreshStatus::Refreshing
        ) {
            debug!(slug = %slug, status = %current.refresh_status, "source already settled");
            return Ok(false);
        }
        let written = sources
            .mark_failed_if_unchanged(&slug, current.updated_at, current.refresh_status)
            .await?;
        if !written {
            debug!(slug = %slug, "source moved on; failed status not written");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, RetryPolicy};
    use crate::publish::NoopPublisher;
    use crate::sources::{InMemorySourceStore, SourceStore};
    use crate::views::{CatalogResolver, InMemoryArtifactStore, InMemoryDependencyCatalog};
    use serde_json::json;

    fn dispatcher(jobs: Arc<InMemoryJobStore>, sources: Arc<InMemorySourceStore>) -> Dispatcher {
        let pipeline = RefreshPipeline::new(
            sources,
            InMemoryArtifactStore::arc(),
            Arc::new(CatalogResolver::new(InMemoryDependencyCatalog::with_ids(["1"]))),
            Arc::new(NoopPublisher),
        );
        Dispatcher::new(jobs, pipeline, RetryController::new(RetryPolicy::default()))
    }

    async fn enqueue(jobs: &InMemoryJobStore, slug: &str) -> JobId {
        jobs.upsert_queued(JobType::RefreshViews, slug, json!({ "slug": slug }))
            .await
            .unwrap()
            .job_id()
    }

    #[tokio::test]
    async fn empty_queue_processes_nothing() {
        let d = dispatcher(InMemoryJobStore::arc(), InMemorySourceStore::arc());
        assert!(d.process_one_queued_job(JobType::RefreshViews).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_marks_job_done() {
        let jobs = InMemoryJobStore::arc();
        let sources = InMemorySourceStore::arc();
        let slug = SourceSlug::new("a").unwrap();
        sources.upsert(slug.clone(), json!({ "views": [{ "dependencies": [1] }] }));
        let id = enqueue(&jobs, "a").await;

        let outcome = dispatcher(jobs.clone(), sources.clone())
            .process_one_queued_job(JobType::RefreshViews)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded(ref s) if s.resolved == 1));

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert!(job.last_error.is_none());
        assert!(sources.get(&slug).await.unwrap().unwrap().refresh_status.is_clean());
    }

    #[tokio::test]
    async fn missing_source_finishes_the_job() {
        let jobs = InMemoryJobStore::arc();
        let id = enqueue(&jobs, "ghost").await;

        let outcome = dispatcher(jobs.clone(), InMemorySourceStore::arc())
            .process_one_queued_job(JobType::RefreshViews)
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::SourceMissing));
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.last_error.as_deref(), Some(SOURCE_MISSING_MESSAGE));
    }

    #[tokio::test]
    async fn invalid_config_fails_job_and_source() {
        let jobs = InMemoryJobStore::arc();
        let sources = InMemorySourceStore::arc();
        let slug = SourceSlug::new("a").unwrap();
        sources.upsert(slug.clone(), json!(["not", "an", "object"]));
        let id = enqueue(&jobs, "a").await;

        let outcome = dispatcher(jobs.clone(), sources.clone())
            .process_one_queued_job(JobType::RefreshViews)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            sources.get(&slug).await.unwrap().unwrap().refresh_status,
            RefreshStatus::Failed
        );
    }

    #[tokio::test]
    async fn reclaim_restores_abandoned_claims() {
        let jobs = InMemoryJobStore::arc();
        let id = enqueue(&jobs, "a").await;
        let d = dispatcher(jobs.clone(), InMemorySourceStore::arc());

        let claimed = d.claim_next_queued_job(JobType::RefreshViews).await.unwrap().unwrap();
        assert!(d.reclaim_abandoned(Duration::from_secs(60)).await.unwrap().is_empty());

        jobs.backdate_claim(claimed.id, Utc::now() - chrono::Duration::seconds(120))
            .unwrap();
        let reclaimed = d.reclaim_abandoned(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].disposition, ReclaimDisposition::Requeued);
        assert_eq!(jobs.get(id).await.unwrap().unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn final_failure_defers_to_a_queued_follow_up() {
        let jobs = InMemoryJobStore::arc();
        let sources = InMemorySourceStore::arc();
        let slug = SourceSlug::new("a").unwrap();
        sources.upsert(slug.clone(), json!(["not", "an", "object"]));
        enqueue(&jobs, "a").await;
        let d = dispatcher(jobs.clone(), sources.clone());

        let first = d.claim_next_queued_job(JobType::RefreshViews).await.unwrap().unwrap();
        enqueue(&jobs, "a").await;
        let outcome = d.process_job(first).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_ne!(
            sources.get(&slug).await.unwrap().unwrap().refresh_status,
            RefreshStatus::Failed
        );

        // The follow-up fails the same way and has nothing behind it.
        let outcome = d.process_one_queued_job(JobType::RefreshViews).await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Failed { .. })));
        assert_eq!(
            sources.get(&slug).await.unwrap().unwrap().refresh_status,
            RefreshStatus::Failed
        );
    }
}
