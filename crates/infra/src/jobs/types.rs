//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use viewforge_core::{DomainError, SourceSlug};

/// `last_error` recorded when a job stops because its source changed again.
pub const SUPERSEDED_MESSAGE: &str = "superseded by newer update";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job type discriminator, persisted as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Recompute and publish the views of one source.
    #[serde(rename = "refresh")]
    RefreshViews,
}

impl JobType {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobType::RefreshViews => "refresh",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refresh" => Ok(JobType::RefreshViews),
            other => Err(DomainError::validation(format!("unknown job type {other:?}"))),
        }
    }
}

/// Job lifecycle state.
///
/// `queued -> processing -> {done, failed}`. A processing job goes back to
/// `queued` only through the retry controller or the abandoned-claim sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Processing,
    /// Finished (successfully or superseded)
    Done,
    /// Exhausted retries or hit a non-retryable error
    Failed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state {other:?}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total processing attempts allowed (the first run included)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that fails on the first pipeline error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the job may be claimed again after failing `attempt`
    /// (1-indexed: the attempt that just failed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has been claimed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Payload of a [`JobType::RefreshViews`] job.
///
/// The pipeline re-reads the source's current configuration, so the slug is
/// all it strictly needs; `dependency_ids` snapshots what the editor knew to
/// depend on the source when the change was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPayload {
    pub slug: SourceSlug,
    #[serde(default)]
    pub dependency_ids: Vec<String>,
}

impl RefreshPayload {
    pub fn new(slug: SourceSlug) -> Self {
        Self {
            slug,
            dependency_ids: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependency_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// A persisted unit of refresh work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Logical key (the source slug); at most one queued job per key.
    pub key: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Number of claims so far; incremented by every claim.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time a re-queued job may be claimed again.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(job_type: JobType, key: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type,
            key: key.into(),
            payload,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            scheduled_at: None,
        }
    }

    /// Decode the payload of a refresh job.
    pub fn refresh_payload(&self) -> Result<RefreshPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.attempts += 1;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_done(&mut self, note: Option<&str>, now: DateTime<Utc>) {
        self.state = JobState::Done;
        if let Some(note) = note {
            self.last_error = Some(note.to_string());
        }
        self.updated_at = now;
    }

    pub(crate) fn mark_requeued(&mut self, error: &str, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Queued;
        self.last_error = Some(error.to_string());
        self.scheduled_at = Some(retry_at);
        self.claimed_at = None;
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }
}

/// `last_error` for a failed attempt that was folded into a newer queued job.
pub fn superseded_after_failure(error: &str) -> String {
    format!("{SUPERSEDED_MESSAGE}; last failure: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(90), Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 1..=5 {
            let nominal = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((delay - nominal).abs() <= nominal * 0.1 + 1.0, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn job_state_text_round_trip() {
        for state in [JobState::Queued, JobState::Processing, JobState::Done, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert_eq!("refresh".parse::<JobType>().unwrap(), JobType::RefreshViews);
    }

    #[test]
    fn job_lifecycle() {
        let slug = SourceSlug::new("explorer-A").unwrap();
        let payload = serde_json::to_value(RefreshPayload::new(slug.clone())).unwrap();
        let mut job = Job::new(JobType::RefreshViews, slug.as_str(), payload);

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.is_ready(Utc::now()));
        assert_eq!(job.refresh_payload().unwrap().slug, slug);

        let now = Utc::now();
        job.mark_claimed(now);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claimed_at, Some(now));
        assert!(!job.is_ready(now));

        let retry_at = now + chrono::Duration::seconds(30);
        job.mark_requeued("boom", retry_at, now);
        assert_eq!(job.state, JobState::Queued);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(retry_at));

        job.mark_claimed(retry_at);
        assert_eq!(job.attempts, 2);
        job.mark_done(Some(SUPERSEDED_MESSAGE), retry_at);
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.last_error.as_deref(), Some(SUPERSEDED_MESSAGE));
    }

    #[test]
    fn payload_defaults_dependency_ids() {
        let payload: RefreshPayload = serde_json::from_value(serde_json::json!({ "slug": "a" })).unwrap();
        assert!(payload.dependency_ids.is_empty());
        assert!(serde_json::from_value::<RefreshPayload>(serde_json::json!({ "slug": "a b" })).is_err());
    }
}
