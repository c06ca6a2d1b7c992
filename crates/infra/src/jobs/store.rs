//! Job storage abstraction and the in-memory implementation.
//!
//! Every state transition is a single atomic store operation. Terminal writes
//! (`complete`, `requeue`, `fail`) only apply while the job is still
//! `processing` under the same claim (same `attempts` value); otherwise they
//! return [`JobStoreError::LostClaim`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

use super::types::{Job, JobId, JobState, JobType, superseded_after_failure};

/// Result of [`JobStore::upsert_queued`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// No queued job existed for the key; a new one was created.
    Inserted(JobId),
    /// The queued job for the key absorbed the change.
    Coalesced(JobId),
}

impl UpsertResult {
    pub fn job_id(self) -> JobId {
        match self {
            UpsertResult::Inserted(id) | UpsertResult::Coalesced(id) => id,
        }
    }
}

/// Result of [`JobStore::requeue`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueResult {
    /// The job is `queued` again and becomes claimable at `retry_at`.
    Requeued { retry_at: DateTime<Utc> },
    /// A newer queued job for the same key already exists; this job ended
    /// `done` as superseded and the queued job redoes the work.
    Folded { into: JobId },
}

/// What the abandoned-claim sweep did with one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimDisposition {
    Requeued,
    Superseded,
    Failed,
}

/// A processing job recovered by [`JobStore::reclaim_expired`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reclaimed {
    /// The job as stored after the sweep.
    pub job: Job,
    pub disposition: ReclaimDisposition,
}

/// Filter for [`JobStore::find`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub job_type: Option<JobType>,
    pub state: Option<JobState>,
    pub key: Option<String>,
}

impl JobQuery {
    pub fn for_key(job_type: JobType, key: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type),
            state: None,
            key: Some(key.into()),
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.job_type.is_none_or(|t| job.job_type == t)
            && self.state.is_none_or(|s| job.state == s)
            && self.key.as_deref().is_none_or(|k| job.key == k)
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl JobStats {
    fn count(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Processing => self.processing += 1,
            JobState::Done => self.done += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The job is no longer `processing` under the caller's claim.
    #[error("claim lost for job {0}")]
    LostClaim(JobId),
    #[error("conflicting job state: {0}")]
    Conflict(String),
    #[error("job serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for JobStoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => JobStoreError::Conflict(msg),
            StoreError::Serialization(msg) => JobStoreError::Serialization(msg),
            // Job rows carry no foreign keys; anything else is a storage fault.
            StoreError::NotFound(msg) | StoreError::Storage(msg) => JobStoreError::Storage(msg),
        }
    }
}

/// Durable job storage.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job for `(job_type, key)` or, if one is already queued,
    /// replace its payload and bump its `updated_at`. Never touches a
    /// processing job.
    async fn upsert_queued(
        &self,
        job_type: JobType,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<UpsertResult, JobStoreError>;

    /// Claim the oldest claimable queued job: `scheduled_at` not in the future
    /// and no processing job with the same key.
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, JobStoreError>;

    /// Mark a claimed job `done`. `note` is stored as `last_error`.
    async fn complete(&self, job: &Job, note: Option<&str>) -> Result<Job, JobStoreError>;

    /// Put a claimed job back in the queue, claimable from `retry_at`.
    async fn requeue(
        &self,
        job: &Job,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RequeueResult, JobStoreError>;

    /// Mark a claimed job `failed`.
    async fn fail(&self, job: &Job, error: &str) -> Result<Job, JobStoreError>;

    /// Recover processing jobs claimed before `claimed_before`.
    async fn reclaim_expired(
        &self,
        job_type: JobType,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Reclaimed>, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `query`, oldest first.
    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self, job_type: JobType) -> Result<JobStats, JobStoreError>;
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn upsert_queued(
        &self,
        job_type: JobType,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<UpsertResult, JobStoreError> {
        (**self).upsert_queued(job_type, key, payload).await
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(job_type).await
    }

    async fn complete(&self, job: &Job, note: Option<&str>) -> Result<Job, JobStoreError> {
        (**self).complete(job, note).await
    }

    async fn requeue(
        &self,
        job: &Job,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RequeueResult, JobStoreError> {
        (**self).requeue(job, error, retry_at).await
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Job, JobStoreError> {
        (**self).fail(job, error).await
    }

    async fn reclaim_expired(
        &self,
        job_type: JobType,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Reclaimed>, JobStoreError> {
        (**self).reclaim_expired(job_type, claimed_before, max_attempts).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        (**self).find(query).await
    }

    async fn stats(&self, job_type: JobType) -> Result<JobStats, JobStoreError> {
        (**self).stats(job_type).await
    }
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    /// Insertion order; ties on `created_at` are broken by this.
    order: Vec<JobId>,
}

impl JobTable {
    fn queued_for(&self, job_type: JobType, key: &str) -> Option<JobId> {
        self.order.iter().copied().find(|id| {
            self.jobs.get(id).is_some_and(|j| {
                j.job_type == job_type && j.key == key && j.state == JobState::Queued
            })
        })
    }

    fn processing_for(&self, job_type: JobType, key: &str) -> bool {
        self.jobs.values().any(|j| {
            j.job_type == job_type && j.key == key && j.state == JobState::Processing
        })
    }

    /// The stored job, if `claimed` still holds its claim.
    fn claimed_mut(&mut self, claimed: &Job) -> Result<&mut Job, JobStoreError> {
        let job = self
            .jobs
            .get_mut(&claimed.id)
            .ok_or(JobStoreError::NotFound(claimed.id))?;
        if job.state != JobState::Processing || job.attempts != claimed.attempts {
            return Err(JobStoreError::LostClaim(claimed.id));
        }
        Ok(job)
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex serialises every operation, which gives each one the same
/// atomicity the Postgres statements have.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: Mutex<JobTable>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move a claimed job's `claimed_at` back in time. Lets tests simulate a
    /// worker that died mid-claim.
    pub fn backdate_claim(&self, id: JobId, claimed_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut table = self.lock();
        let job = table.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.claimed_at = Some(claimed_at);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_queued(
        &self,
        job_type: JobType,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<UpsertResult, JobStoreError> {
        let mut table = self.lock();

        if let Some(id) = table.queued_for(job_type, key) {
            if let Some(job) = table.jobs.get_mut(&id) {
                job.payload = payload;
                job.updated_at = Utc::now();
                return Ok(UpsertResult::Coalesced(id));
            }
        }

        let job = Job::new(job_type, key, payload);
        let id = job.id;
        table.order.push(id);
        table.jobs.insert(id, job);
        Ok(UpsertResult::Inserted(id))
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, JobStoreError> {
        let mut table = self.lock();
        let now = Utc::now();

        let mut candidates: Vec<(usize, &Job)> = table
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| table.jobs.get(id).map(|j| (seq, j)))
            .filter(|(_, j)| {
                j.job_type == job_type
                    && j.is_ready(now)
                    && !table.processing_for(job_type, &j.key)
            })
            .collect();

        // FIFO by creation time, then insertion order.
        candidates.sort_by_key(|(seq, j)| (j.created_at, *seq));

        let Some(id) = candidates.first().map(|(_, j)| j.id) else {
            return Ok(None);
        };
        let job = table.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.mark_claimed(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job: &Job, note: Option<&str>) -> Result<Job, JobStoreError> {
        let mut table = self.lock();
        let stored = table.claimed_mut(job)?;
        stored.mark_done(note, Utc::now());
        Ok(stored.clone())
    }

    async fn requeue(
        &self,
        job: &Job,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RequeueResult, JobStoreError> {
        let mut table = self.lock();
        table.claimed_mut(job)?;

        let now = Utc::now();
        if let Some(sibling) = table.queued_for(job.job_type, &job.key) {
            let stored = table.claimed_mut(job)?;
            stored.mark_done(Some(&superseded_after_failure(error)), now);
            return Ok(RequeueResult::Folded { into: sibling });
        }

        let stored = table.claimed_mut(job)?;
        stored.mark_requeued(error, retry_at, now);
        Ok(RequeueResult::Requeued { retry_at })
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Job, JobStoreError> {
        let mut table = self.lock();
        let stored = table.claimed_mut(job)?;
        stored.mark_failed(error, Utc::now());
        Ok(stored.clone())
    }

    async fn reclaim_expired(
        &self,
        job_type: JobType,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<Reclaimed>, JobStoreError> {
        let mut table = self.lock();
        let now = Utc::now();

        let expired: Vec<JobId> = table
            .order
            .iter()
            .copied()
            .filter(|id| {
                table.jobs.get(id).is_some_and(|j| {
                    j.job_type == job_type
                        && j.state == JobState::Processing
                        && j.claimed_at.is_some_and(|at| at < claimed_before)
                })
            })
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(key) = table.jobs.get(&id).map(|j| j.key.clone()) else {
                continue;
            };
            let sibling = table.queued_for(job_type, &key);
            let Some(job) = table.jobs.get_mut(&id) else {
                continue;
            };

            let disposition = if job.attempts >= max_attempts {
                job.mark_failed("claim expired after final attempt", now);
                ReclaimDisposition::Failed
            } else if sibling.is_some() {
                job.mark_done(Some(&superseded_after_failure("claim expired")), now);
                ReclaimDisposition::Superseded
            } else {
                job.mark_requeued("claim expired", now, now);
                ReclaimDisposition::Requeued
            };

            reclaimed.push(Reclaimed {
                job: job.clone(),
                disposition,
            });
        }

        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let table = self.lock();
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .filter(|j| query.matches(j))
            .cloned()
            .collect())
    }

    async fn stats(&self, job_type: JobType) -> Result<JobStats, JobStoreError> {
        let table = self.lock();
        let mut stats = JobStats::default();
        for job in table.jobs.values().filter(|j| j.job_type == job_type) {
            stats.count(job.state);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::SUPERSEDED_MESSAGE;
    use serde_json::json;

    const T: JobType = JobType::RefreshViews;

    async fn claim(store: &InMemoryJobStore) -> Job {
        store.claim_next(T).await.unwrap().expect("a claimable job")
    }

    #[test]
    fn shared_store_errors_keep_their_meaning_for_jobs() {
        let conflict = JobStoreError::from(StoreError::Conflict("dup".into()));
        assert!(matches!(conflict, JobStoreError::Conflict(ref m) if m == "dup"));
        assert!(matches!(
            JobStoreError::from(StoreError::Serialization("bad row".into())),
            JobStoreError::Serialization(_)
        ));
        assert!(matches!(
            JobStoreError::from(StoreError::NotFound("fk".into())),
            JobStoreError::Storage(_)
        ));
    }

    #[tokio::test]
    async fn upsert_coalesces_while_queued() {
        let store = InMemoryJobStore::new();

        let first = store.upsert_queued(T, "a", json!({ "v": 1 })).await.unwrap();
        let second = store.upsert_queued(T, "a", json!({ "v": 2 })).await.unwrap();
        let other = store.upsert_queued(T, "b", json!({ "v": 1 })).await.unwrap();

        assert!(matches!(first, UpsertResult::Inserted(_)));
        assert_eq!(second, UpsertResult::Coalesced(first.job_id()));
        assert!(matches!(other, UpsertResult::Inserted(_)));

        let job = store.get(first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({ "v": 2 }));
        assert_eq!(job.attempts, 0);
        assert!(job.updated_at >= job.created_at);
    }

    #[tokio::test]
    async fn upsert_while_processing_inserts_a_follow_up() {
        let store = InMemoryJobStore::new();
        let first = store.upsert_queued(T, "a", json!({})).await.unwrap();
        let claimed = claim(&store).await;
        assert_eq!(claimed.id, first.job_id());

        let follow_up = store.upsert_queued(T, "a", json!({ "v": 2 })).await.unwrap();
        assert!(matches!(follow_up, UpsertResult::Inserted(id) if id != claimed.id));

        let processing = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(processing.state, JobState::Processing);
        assert_eq!(processing.payload, json!({}));
    }

    #[tokio::test]
    async fn claim_is_fifo_and_skips_keys_already_processing() {
        let store = InMemoryJobStore::new();
        let a1 = store.upsert_queued(T, "a", json!({})).await.unwrap().job_id();
        let b1 = store.upsert_queued(T, "b", json!({})).await.unwrap().job_id();

        assert_eq!(claim(&store).await.id, a1);
        let a2 = store.upsert_queued(T, "a", json!({})).await.unwrap().job_id();

        // a2 waits for a1 to finish.
        assert_eq!(claim(&store).await.id, b1);
        assert!(store.claim_next(T).await.unwrap().is_none());

        let a1_job = store.get(a1).await.unwrap().unwrap();
        store.complete(&a1_job, None).await.unwrap();
        let next = claim(&store).await;
        assert_eq!(next.id, a2);
        assert_eq!(next.attempts, 1);
        assert!(next.claimed_at.is_some());
    }

    #[tokio::test]
    async fn claim_respects_scheduled_at() {
        let store = InMemoryJobStore::new();
        store.upsert_queued(T, "a", json!({})).await.unwrap();
        let job = claim(&store).await;

        let later = Utc::now() + chrono::Duration::seconds(60);
        let result = store.requeue(&job, "boom", later).await.unwrap();
        assert_eq!(result, RequeueResult::Requeued { retry_at: later });
        assert!(store.claim_next(T).await.unwrap().is_none());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(stored.scheduled_at, Some(later));
    }

    #[tokio::test]
    async fn requeue_folds_into_a_newer_queued_job() {
        let store = InMemoryJobStore::new();
        store.upsert_queued(T, "a", json!({})).await.unwrap();
        let job = claim(&store).await;
        let newer = store.upsert_queued(T, "a", json!({ "v": 2 })).await.unwrap().job_id();

        let result = store.requeue(&job, "boom", Utc::now()).await.unwrap();
        assert_eq!(result, RequeueResult::Folded { into: newer });

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Done);
        assert!(stored.last_error.unwrap().starts_with(SUPERSEDED_MESSAGE));
        let queued = store
            .find(&JobQuery::for_key(T, "a").with_state(JobState::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn terminal_writes_require_the_current_claim() {
        let store = InMemoryJobStore::new();
        store.upsert_queued(T, "a", json!({})).await.unwrap();
        let stale = claim(&store).await;

        store
            .backdate_claim(stale.id, Utc::now() - chrono::Duration::seconds(600))
            .unwrap();
        store.reclaim_expired(T, Utc::now(), 5).await.unwrap();
        let fresh = claim(&store).await;
        assert_eq!(fresh.attempts, 2);

        assert!(matches!(
            store.complete(&stale, None).await,
            Err(JobStoreError::LostClaim(_))
        ));
        assert!(matches!(
            store.fail(&stale, "late").await,
            Err(JobStoreError::LostClaim(_))
        ));
        store.complete(&fresh, None).await.unwrap();
        assert!(matches!(
            store.complete(&fresh, None).await,
            Err(JobStoreError::LostClaim(_))
        ));
    }

    #[tokio::test]
    async fn reclaim_sorts_expired_claims() {
        let store = InMemoryJobStore::new();
        let old = Utc::now() - chrono::Duration::seconds(600);

        // requeued: attempts left, no sibling
        store.upsert_queued(T, "a", json!({})).await.unwrap();
        let a = claim(&store).await;
        store.backdate_claim(a.id, old).unwrap();

        // superseded: a newer job is queued
        store.upsert_queued(T, "b", json!({})).await.unwrap();
        let b = claim(&store).await;
        store.backdate_claim(b.id, old).unwrap();
        store.upsert_queued(T, "b", json!({ "v": 2 })).await.unwrap();

        // not expired
        store.upsert_queued(T, "c", json!({})).await.unwrap();
        let c = claim(&store).await;

        let reclaimed = store
            .reclaim_expired(T, Utc::now() - chrono::Duration::seconds(60), 5)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(reclaimed[0].job.id, a.id);
        assert_eq!(reclaimed[0].disposition, ReclaimDisposition::Requeued);
        assert_eq!(reclaimed[0].job.state, JobState::Queued);
        assert_eq!(reclaimed[1].job.id, b.id);
        assert_eq!(reclaimed[1].disposition, ReclaimDisposition::Superseded);

        assert_eq!(store.get(c.id).await.unwrap().unwrap().state, JobState::Processing);

        // exhausted attempts
        let again = claim(&store).await;
        assert_eq!(again.id, a.id);
        store.backdate_claim(a.id, old).unwrap();
        let reclaimed = store.reclaim_expired(T, Utc::now(), 2).await.unwrap();
        let failed: Vec<_> = reclaimed
            .iter()
            .filter(|r| r.disposition == ReclaimDisposition::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, a.id);
    }

    #[tokio::test]
    async fn stats_count_states() {
        let store = InMemoryJobStore::new();
        store.upsert_queued(T, "a", json!({})).await.unwrap();
        store.upsert_queued(T, "b", json!({})).await.unwrap();
        store.upsert_queued(T, "c", json!({})).await.unwrap();
        let a = claim(&store).await;
        store.complete(&a, None).await.unwrap();
        let b = claim(&store).await;
        store.fail(&b, "nope").await.unwrap();
        claim(&store).await;

        let stats = store.stats(T).await.unwrap();
        assert_eq!(
            stats,
            JobStats {
                queued: 0,
                processing: 1,
                done: 1,
                failed: 1
            }
        );
    }
}
