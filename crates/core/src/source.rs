//! Source documents whose edits trigger view refreshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::SourceSlug;

/// Externally visible refresh health of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Views reflect the current configuration.
    Clean,
    /// An edit was accepted and a refresh is queued.
    Pending,
    /// A worker is recomputing views.
    Refreshing,
    /// The last refresh exhausted its retries.
    Failed,
}

impl RefreshStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Pending => "pending",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
        }
    }

    pub fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl core::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for RefreshStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(Self::Clean),
            "pending" => Ok(Self::Pending),
            "refreshing" => Ok(Self::Refreshing),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!(
                "unknown refresh status {other:?}"
            ))),
        }
    }
}

/// An editable configuration document.
///
/// `updated_at` is the staleness clock: any configuration write moves it
/// forward, which invalidates refresh work that started from an older copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub slug: SourceSlug,
    pub config: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub refresh_status: RefreshStatus,
}

impl Source {
    pub fn new(slug: SourceSlug, config: serde_json::Value) -> Self {
        Self {
            slug,
            config,
            updated_at: Utc::now(),
            refresh_status: RefreshStatus::Clean,
        }
    }
}
