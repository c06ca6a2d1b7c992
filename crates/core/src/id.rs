//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const MAX_SLUG_LEN: usize = 128;

/// Logical key of a source document (e.g. `"explorer-A"`).
///
/// Slugs are the coalescing key of the refresh queue, so two spellings of the
/// same slug must never compare unequal: they are kept verbatim (case
/// preserved) and restricted to ASCII alphanumerics, `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceSlug(String);

impl SourceSlug {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("SourceSlug: empty"));
        }
        if value.len() > MAX_SLUG_LEN {
            return Err(DomainError::invalid_id(format!(
                "SourceSlug: longer than {MAX_SLUG_LEN} bytes"
            )));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DomainError::invalid_id(format!(
                "SourceSlug: unexpected character {bad:?} in {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SourceSlug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceSlug {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SourceSlug {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SourceSlug> for String {
    fn from(value: SourceSlug) -> Self {
        value.0
    }
}

impl AsRef<str> for SourceSlug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
