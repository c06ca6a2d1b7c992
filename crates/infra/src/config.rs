//! Runtime configuration read from `VIEWFORGE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{RetryPolicy, WorkerPoolConfig};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_WORKERS: &str = "VIEWFORGE_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "VIEWFORGE_POLL_INTERVAL_MS";
pub const ENV_MAX_ATTEMPTS: &str = "VIEWFORGE_MAX_ATTEMPTS";
pub const ENV_BACKOFF_BASE_MS: &str = "VIEWFORGE_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "VIEWFORGE_BACKOFF_MAX_MS";
pub const ENV_CLAIM_TIMEOUT_SECS: &str = "VIEWFORGE_CLAIM_TIMEOUT_SECS";
pub const ENV_RECLAIM_INTERVAL_SECS: &str = "VIEWFORGE_RECLAIM_INTERVAL_SECS";
pub const ENV_PUBLISH_DIR: &str = "VIEWFORGE_PUBLISH_DIR";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Refresh worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    pub database_url: Option<String>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// No default: operators must pick a value longer than the slowest
    /// legitimate refresh.
    pub claim_timeout: Option<Duration>,
    pub reclaim_interval: Duration,
    pub publish_dir: Option<PathBuf>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workers: 2,
            poll_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            claim_timeout: None,
            reclaim_interval: Duration::from_secs(30),
            publish_dir: None,
        }
    }
}

impl RefreshConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let workers = parse_or(&get, ENV_WORKERS, defaults.workers)?;
        if workers == 0 {
            return Err(invalid(ENV_WORKERS, "0", "must be at least 1"));
        }

        let max_attempts: u32 = parse_or(&get, ENV_MAX_ATTEMPTS, defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid(ENV_MAX_ATTEMPTS, "0", "must be at least 1"));
        }

        let base_ms: u64 = parse_or(
            &get,
            ENV_BACKOFF_BASE_MS,
            defaults.retry.base_delay.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_or(
            &get,
            ENV_BACKOFF_MAX_MS,
            defaults.retry.max_delay.as_millis() as u64,
        )?;
        if max_ms < base_ms {
            return Err(invalid(
                ENV_BACKOFF_MAX_MS,
                &max_ms.to_string(),
                "must not be below the backoff base",
            ));
        }

        let claim_timeout = match get(ENV_CLAIM_TIMEOUT_SECS) {
            Some(raw) => {
                let secs: u64 = parse(ENV_CLAIM_TIMEOUT_SECS, &raw)?;
                if secs == 0 {
                    return Err(invalid(ENV_CLAIM_TIMEOUT_SECS, &raw, "must be positive"));
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            database_url: get(ENV_DATABASE_URL),
            workers,
            poll_interval: Duration::from_millis(parse_or(
                &get,
                ENV_POLL_INTERVAL_MS,
                defaults.poll_interval.as_millis() as u64,
            )?),
            retry: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            ),
            claim_timeout,
            reclaim_interval: Duration::from_secs(parse_or(
                &get,
                ENV_RECLAIM_INTERVAL_SECS,
                defaults.reclaim_interval.as_secs(),
            )?),
            publish_dir: get(ENV_PUBLISH_DIR).map(PathBuf::from),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing {
            name: ENV_DATABASE_URL,
        })
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        let config = WorkerPoolConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(self.poll_interval)
            .with_reclaim_interval(self.reclaim_interval);
        match self.claim_timeout {
            Some(timeout) => config.with_claim_timeout(timeout),
            None => config,
        }
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(name, raw, e.to_string()))
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => parse(name, &raw),
        None => Ok(default),
    }
}
