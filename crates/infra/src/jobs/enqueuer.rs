//! Coalescing enqueuer: turns source change notifications into refresh jobs.

use tracing::{debug, info, instrument, warn};

use viewforge_core::{RefreshStatus, SourceSlug};

use crate::error::StoreError;
use crate::sources::SourceStore;

use super::store::{JobStore, JobStoreError, UpsertResult};
use super::types::{JobId, JobType, RefreshPayload};

/// Outcome of [`CoalescingEnqueuer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new queued job was created.
    Inserted(JobId),
    /// The change was folded into the job already queued for the source.
    Coalesced(JobId),
    /// The source does not exist; nothing was enqueued.
    SourceMissing,
}

impl EnqueueResult {
    pub fn job_id(self) -> Option<JobId> {
        match self {
            EnqueueResult::Inserted(id) | EnqueueResult::Coalesced(id) => Some(id),
            EnqueueResult::SourceMissing => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("source store: {0}")]
    Source(#[from] StoreError),
    #[error("job store: {0}")]
    Jobs(#[from] JobStoreError),
    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Records that a source changed and needs its views refreshed.
///
/// Bursts of edits collapse into one queued job per source; an edit that
/// arrives while a refresh is running queues exactly one follow-up.
#[derive(Debug, Clone)]
pub struct CoalescingEnqueuer<J, S> {
    jobs: J,
    sources: S,
}

impl<J: JobStore, S: SourceStore> CoalescingEnqueuer<J, S> {
    pub fn new(jobs: J, sources: S) -> Self {
        Self { jobs, sources }
    }

    /// Mark the source `pending` and queue (or coalesce) its refresh job.
    ///
    /// If the job store rejects the upsert the source is left `pending` with
    /// no job behind it and the error is returned; enqueueing again is safe
    /// and repairs it.
    #[instrument(skip(self, dependency_ids), fields(slug = %slug), err)]
    pub async fn enqueue(
        &self,
        slug: &SourceSlug,
        dependency_ids: Vec<String>,
    ) -> Result<EnqueueResult, EnqueueError> {
        // Marked before the upsert so a worker that claims immediately
        // overwrites `pending` rather than the other way round.
        if !self.sources.set_refresh_status(slug, RefreshStatus::Pending).await? {
            debug!("source missing; nothing enqueued");
            return Ok(EnqueueResult::SourceMissing);
        }

        let payload = RefreshPayload::new(slug.clone()).with_dependencies(dependency_ids);
        let payload = serde_json::to_value(payload)?;

        let upserted = self
            .jobs
            .upsert_queued(JobType::RefreshViews, slug.as_str(), payload)
            .await
            .inspect_err(|e| warn!(error = %e, "source left pending without a queued job"))?;
        let result = match upserted {
            UpsertResult::Inserted(id) => {
                info!(job_id = %id, outcome = "inserted", "refresh enqueued");
                EnqueueResult::Inserted(id)
            }
            UpsertResult::Coalesced(id) => {
                info!(job_id = %id, outcome = "coalesced", "refresh enqueued");
                EnqueueResult::Coalesced(id)
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, JobQuery};
    use crate::jobs::types::JobState;
    use crate::sources::InMemorySourceStore;
    use crate::jobs::store::{JobStats, Reclaimed, RequeueResult};
    use crate::jobs::types::Job;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn slug(s: &str) -> SourceSlug {
        SourceSlug::new(s).unwrap()
    }

    fn setup(slugs: &[&str]) -> (Arc<InMemoryJobStore>, Arc<InMemorySourceStore>) {
        let jobs = InMemoryJobStore::arc();
        let sources = InMemorySourceStore::arc();
        for s in slugs {
            sources.upsert(slug(s), json!({ "views": [] }));
        }
        (jobs, sources)
    }

    #[tokio::test]
    async fn repeated_enqueues_leave_one_queued_job() {
        let (jobs, sources) = setup(&["explorer-A"]);
        let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources.clone());
        let a = slug("explorer-A");

        let first = enqueuer.enqueue(&a, vec!["1".into()]).await.unwrap();
        let second = enqueuer.enqueue(&a, vec!["2".into()]).await.unwrap();
        let third = enqueuer.enqueue(&a, vec!["3".into()]).await.unwrap();

        assert!(matches!(first, EnqueueResult::Inserted(_)));
        assert_eq!(second, EnqueueResult::Coalesced(first.job_id().unwrap()));
        assert_eq!(third, EnqueueResult::Coalesced(first.job_id().unwrap()));

        let queued = jobs
            .find(&JobQuery::for_key(JobType::RefreshViews, "explorer-A").with_state(JobState::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 0);
        let payload = queued[0].refresh_payload().unwrap();
        assert_eq!(payload.dependency_ids, vec!["3".to_string()]);
        assert_eq!(
            sources.snapshot(&a).unwrap().refresh_status,
            RefreshStatus::Pending
        );
    }

    #[tokio::test]
    async fn missing_source_enqueues_nothing() {
        let (jobs, sources) = setup(&[]);
        let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources);

        let result = enqueuer.enqueue(&slug("ghost"), Vec::new()).await.unwrap();
        assert_eq!(result, EnqueueResult::SourceMissing);
        assert!(jobs.find(&JobQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_during_processing_adds_one_follow_up() {
        let (jobs, sources) = setup(&["a"]);
        let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources);

        let first = enqueuer.enqueue(&slug("a"), Vec::new()).await.unwrap();
        let claimed = jobs.claim_next(JobType::RefreshViews).await.unwrap().unwrap();
        assert_eq!(Some(claimed.id), first.job_id());

        let follow_up = enqueuer.enqueue(&slug("a"), Vec::new()).await.unwrap();
        let again = enqueuer.enqueue(&slug("a"), Vec::new()).await.unwrap();
        assert!(matches!(follow_up, EnqueueResult::Inserted(id) if id != claimed.id));
        assert_eq!(again.job_id(), follow_up.job_id());

        let processing = jobs.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(processing.state, JobState::Processing);
        assert_eq!(processing.updated_at, claimed.updated_at);
    }

    /// Job store whose upserts can be switched off.
    #[derive(Default)]
    struct FlakyJobStore {
        inner: InMemoryJobStore,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyJobStore {
        async fn upsert_queued(
            &self,
            job_type: JobType,
            key: &str,
            payload: serde_json::Value,
        ) -> Result<UpsertResult, JobStoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.upsert_queued(job_type, key, payload).await
        }

        async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(job_type).await
        }

        async fn complete(&self, job: &Job, note: Option<&str>) -> Result<Job, JobStoreError> {
            self.inner.complete(job, note).await
        }

        async fn requeue(
            &self,
            job: &Job,
            error: &str,
            retry_at: DateTime<Utc>,
        ) -> Result<RequeueResult, JobStoreError> {
            self.inner.requeue(job, error, retry_at).await
        }

        async fn fail(&self, job: &Job, error: &str) -> Result<Job, JobStoreError> {
            self.inner.fail(job, error).await
        }

        async fn reclaim_expired(
            &self,
            job_type: JobType,
            claimed_before: DateTime<Utc>,
            max_attempts: u32,
        ) -> Result<Vec<Reclaimed>, JobStoreError> {
            self.inner.reclaim_expired(job_type, claimed_before, max_attempts).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn find(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
            self.inner.find(query).await
        }

        async fn stats(&self, job_type: JobType) -> Result<JobStats, JobStoreError> {
            self.inner.stats(job_type).await
        }
    }

    #[tokio::test]
    async fn failed_upsert_surfaces_and_a_retry_repairs_it() {
        let jobs = Arc::new(FlakyJobStore::default());
        let sources = InMemorySourceStore::arc();
        sources.upsert(slug("a"), json!({ "views": [] }));
        let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources.clone());

        jobs.down.store(true, Ordering::SeqCst);
        let err = enqueuer.enqueue(&slug("a"), Vec::new()).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Jobs(JobStoreError::Storage(_))));
        assert_eq!(sources.snapshot(&slug("a")).unwrap().refresh_status, RefreshStatus::Pending);
        assert_eq!(jobs.stats(JobType::RefreshViews).await.unwrap().queued, 0);

        jobs.down.store(false, Ordering::SeqCst);
        let retried = enqueuer.enqueue(&slug("a"), Vec::new()).await.unwrap();
        assert!(matches!(retried, EnqueueResult::Inserted(_)));
        assert_eq!(jobs.stats(JobType::RefreshViews).await.unwrap().queued, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_share_one_job() {
        let (jobs, sources) = setup(&["a", "b"]);
        let enqueuer = Arc::new(CoalescingEnqueuer::new(jobs.clone(), sources));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let enqueuer = enqueuer.clone();
            let name = if i % 2 == 0 { "a" } else { "b" };
            tasks.spawn(async move { (name, enqueuer.enqueue(&slug(name), Vec::new()).await) });
        }
        let mut ids: std::collections::HashMap<&str, std::collections::HashSet<JobId>> =
            Default::default();
        let mut inserted = 0;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = joined.unwrap();
            let result = result.unwrap();
            if matches!(result, EnqueueResult::Inserted(_)) {
                inserted += 1;
            }
            ids.entry(name).or_default().insert(result.job_id().unwrap());
        }

        assert_eq!(inserted, 2);
        assert!(ids.values().all(|set| set.len() == 1), "{ids:?}");
        assert_eq!(jobs.stats(JobType::RefreshViews).await.unwrap().queued, 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// However edits to a set of sources interleave, each source ends with
        /// exactly one queued job carrying the payload of its last edit.
        #[test]
        fn bursts_coalesce_per_source(edits in prop::collection::vec((0usize..4, 0u32..1000), 1..40)) {
            let names = ["s0", "s1", "s2", "s3"];
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (jobs, sources) = setup(&names);
                let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources);

                let mut last = std::collections::HashMap::new();
                for (source, marker) in &edits {
                    let s = slug(names[*source]);
                    enqueuer.enqueue(&s, vec![marker.to_string()]).await.unwrap();
                    last.insert(*source, marker.to_string());
                }

                for (source, marker) in last {
                    let queued = jobs
                        .find(&JobQuery::for_key(JobType::RefreshViews, names[source]).with_state(JobState::Queued))
                        .await
                        .unwrap();
                    assert_eq!(queued.len(), 1);
                    assert_eq!(queued[0].refresh_payload().unwrap().dependency_ids, vec![marker]);
                }
                let stats = jobs.stats(JobType::RefreshViews).await.unwrap();
                assert!(stats.queued <= names.len());
                assert_eq!(stats.processing + stats.done + stats.failed, 0);
            });
        }
    }
}
