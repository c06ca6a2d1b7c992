//! Worker pool: N polling workers plus the abandoned-claim sweeper.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, JobOutcome};
use super::store::ReclaimDisposition;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Idle wait between polls of an empty queue
    pub poll_interval: Duration,
    /// Age after which a processing claim counts as abandoned. `None`
    /// disables the sweeper.
    pub claim_timeout: Option<Duration>,
    /// How often the sweeper runs
    pub reclaim_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
            claim_timeout: None,
            reclaim_interval: Duration::from_secs(30),
            name: "refresh-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = Some(timeout);
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_superseded: u64,
    /// Jobs whose source was deleted before they ran
    pub jobs_source_missing: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub claims_lost: u64,
    pub jobs_reclaimed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Succeeded(_) => self.jobs_succeeded += 1,
            JobOutcome::Superseded { .. } | JobOutcome::Folded { .. } => self.jobs_superseded += 1,
            JobOutcome::SourceMissing => self.jobs_source_missing += 1,
            JobOutcome::Retrying { .. } => self.jobs_retried += 1,
            JobOutcome::Failed { .. } => self.jobs_failed += 1,
            JobOutcome::ClaimLost => self.claims_lost += 1,
        }
    }
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn with_stats(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Runs [`Dispatcher`] steps on tokio tasks until shut down.
///
/// Each worker processes one job to completion before claiming the next, so
/// shutdown never abandons a claim it holds.
pub struct WorkerPool {
    dispatcher: Dispatcher,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(dispatcher: Dispatcher, config: WorkerPoolConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Spawn the workers (and the sweeper, if a claim timeout is set) on the
    /// current tokio runtime.
    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut tasks = Vec::with_capacity(self.config.workers + 1);

        for index in 0..self.config.workers.max(1) {
            let name = format!("{}-{}", self.config.name, index);
            tasks.push(tokio::spawn(worker_loop(
                name,
                self.dispatcher.clone(),
                self.config.poll_interval,
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }

        match self.config.claim_timeout {
            Some(timeout) => tasks.push(tokio::spawn(sweeper_loop(
                format!("{}-sweeper", self.config.name),
                self.dispatcher.clone(),
                timeout,
                self.config.reclaim_interval,
                shutdown_rx,
                stats.clone(),
            ))),
            None => warn!(
                pool = %self.config.name,
                "no claim timeout configured; abandoned jobs will not be reclaimed"
            ),
        }

        info!(pool = %self.config.name, workers = self.config.workers.max(1), "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }
}

/// Wait for `period` or until shutdown is requested. Returns `true` on
/// shutdown.
async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(period) => false,
    }
}

async fn worker_loop(
    name: String,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    info!(worker = %name, "worker started");
    let job_type = dispatcher.job_type();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match dispatcher.claim_next_queued_job(job_type).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker = %name, error = %e, "failed to claim job");
                if idle(&mut shutdown, poll_interval).await {
                    break;
                }
                continue;
            }
        };

        let Some(job) = claimed else {
            if idle(&mut shutdown, poll_interval).await {
                break;
            }
            continue;
        };

        debug!(worker = %name, job_id = %job.id, attempt = job.attempts, "claimed job");
        with_stats(&stats, |s| s.current_running += 1);
        let result = dispatcher.process_job(job).await;
        with_stats(&stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            if let Ok(outcome) = &result {
                s.record(outcome);
            }
        });

        if let Err(e) = result {
            // The job stays processing; the sweeper will pick it up.
            error!(worker = %name, error = %e, "failed to record job outcome");
            if idle(&mut shutdown, poll_interval).await {
                break;
            }
        }
    }

    info!(worker = %name, "worker stopped");
}

async fn sweeper_loop(
    name: String,
    dispatcher: Dispatcher,
    claim_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedStats,
) {
    info!(worker = %name, claim_timeout_secs = claim_timeout.as_secs(), "reclaim sweeper started");

    loop {
        match dispatcher.reclaim_abandoned(claim_timeout).await {
            Ok(reclaimed) if !reclaimed.is_empty() => with_stats(&stats, |s| {
                s.jobs_reclaimed += reclaimed.len() as u64;
                s.jobs_failed += reclaimed
                    .iter()
                    .filter(|r| r.disposition == ReclaimDisposition::Failed)
                    .count() as u64;
            }),
            Ok(_) => {}
            Err(e) => error!(worker = %name, error = %e, "reclaim sweep failed"),
        }

        if idle(&mut shutdown, interval).await {
            break;
        }
    }

    info!(worker = %name, "reclaim sweeper stopped");
}
