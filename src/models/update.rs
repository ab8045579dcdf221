// Update-availability results and their cache entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which signal produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    LatestTag,
    MultiTag,
    CreationDate,
    /// Registry was consulted and no signal applied.
    NoSignal,
    /// No registry data is available (budget exhausted before any check, or the call failed).
    Unchecked,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::LatestTag => "latest_tag",
            UpdateSource::MultiTag => "multi_tag",
            UpdateSource::CreationDate => "creation_date",
            UpdateSource::NoSignal => "no_signal",
            UpdateSource::Unchecked => "unchecked",
        }
    }
}

impl FromStr for UpdateSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "latest_tag" => UpdateSource::LatestTag,
            "multi_tag" => UpdateSource::MultiTag,
            "creation_date" => UpdateSource::CreationDate,
            "no_signal" => UpdateSource::NoSignal,
            "unchecked" => UpdateSource::Unchecked,
            other => anyhow::bail!("unknown update source: {other}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub available: bool,
    /// Served past its freshness window (budget exhausted or registry call failed).
    pub stale: bool,
    pub source: UpdateSource,
    pub checked_at: Option<DateTime<Utc>>,
    /// Version the container runs: its tag, or the short digest when pinned by digest.
    #[serde(default)]
    pub current_version: Option<String>,
    /// Version the registry offers, when the signal names one.
    #[serde(default)]
    pub available_version: Option<String>,
}

impl UpdateCheck {
    pub fn stale_unknown() -> Self {
        Self {
            available: false,
            stale: true,
            source: UpdateSource::Unchecked,
            checked_at: None,
            current_version: None,
            available_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckEntry {
    /// Image reference the entry is keyed by.
    pub image: String,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub available: bool,
    pub source: UpdateSource,
    /// Set when the registry call behind this entry failed.
    pub last_error: Option<String>,
    #[serde(default)]
    pub available_version: Option<String>,
}

impl UpdateCheckEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn to_check(&self, forced_stale: bool) -> UpdateCheck {
        UpdateCheck {
            available: self.available,
            stale: forced_stale || self.last_error.is_some(),
            source: self.source,
            checked_at: Some(self.checked_at),
            current_version: None,
            available_version: self.available_version.clone(),
        }
    }
}
