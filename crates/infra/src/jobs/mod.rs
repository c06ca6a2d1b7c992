//! Refresh job queue.
//!
//! ## Components
//!
//! - `Job`: persisted unit of work keyed by source slug
//! - `JobStore`: atomic state transitions (in-memory or Postgres)
//! - `CoalescingEnqueuer`: one queued job per source, however many edits
//! - `Dispatcher`: claim one job, run the refresh pipeline, record the outcome
//! - `RetryController`: bounded retries with backoff
//! - `WorkerPool`: polling workers plus the abandoned-claim sweeper

pub mod dispatcher;
pub mod enqueuer;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;
pub mod worker;

pub use dispatcher::{DispatchError, Dispatcher, JobOutcome, SOURCE_MISSING_MESSAGE};
pub use enqueuer::{CoalescingEnqueuer, EnqueueError, EnqueueResult};
pub use postgres::PostgresJobStore;
pub use retry::{FailureDisposition, RetryController, RetryDecision};
pub use store::{
    InMemoryJobStore, JobQuery, JobStats, JobStore, JobStoreError, ReclaimDisposition, Reclaimed,
    RequeueResult, UpsertResult,
};
pub use types::{
    BackoffStrategy, Job, JobId, JobState, JobType, RefreshPayload, RetryPolicy, SUPERSEDED_MESSAGE,
};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
