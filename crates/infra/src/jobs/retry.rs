//! Retry/backoff controller for failed refresh attempts.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::pipeline::PipelineError;

use super::store::{JobStore, JobStoreError, RequeueResult};
use super::types::{Job, JobId, RetryPolicy};

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in the queue, claimable from `retry_at`.
    Retry { retry_at: DateTime<Utc> },
    /// Give up.
    Fail,
}

/// What the controller ended up writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Requeued { retry_at: DateTime<Utc> },
    /// A newer queued job for the key already redoes the work.
    Folded { into: JobId },
    Failed,
}

/// Applies a [`RetryPolicy`] to failed attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the fate of `job` after `error`. `job.attempts` counts the
    /// attempt that just failed.
    pub fn decide(&self, job: &Job, error: &PipelineError, now: DateTime<Utc>) -> RetryDecision {
        if !error.is_retryable() || !self.policy.should_retry(job.attempts) {
            return RetryDecision::Fail;
        }
        let delay = self.policy.delay_for_attempt(job.attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            retry_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Record the failure on the job store.
    pub async fn handle_failure(
        &self,
        jobs: &dyn JobStore,
        job: &Job,
        error: &PipelineError,
    ) -> Result<FailureDisposition, JobStoreError> {
        let message = error.to_string();
        match self.decide(job, error, Utc::now()) {
            RetryDecision::Retry { retry_at } => match jobs.requeue(job, &message, retry_at).await? {
                RequeueResult::Requeued { retry_at } => {
                    info!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_attempts = self.policy.max_attempts,
                        %retry_at,
                        error = %message,
                        "refresh failed; retrying"
                    );
                    Ok(FailureDisposition::Requeued { retry_at })
                }
                RequeueResult::Folded { into } => {
                    info!(job_id = %job.id, into = %into, error = %message, "failed attempt folded into newer job");
                    Ok(FailureDisposition::Folded { into })
                }
            },
            RetryDecision::Fail => {
                jobs.fail(job, &message).await?;
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retryable = error.is_retryable(),
                    error = %message,
                    "refresh failed permanently"
                );
                Ok(FailureDisposition::Failed)
            }
        }
    }
}
