// Container records as observed through the remote API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{EndpointId, StackId};

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_NUMBER_LABEL: &str = "com.docker.compose.container-number";

/// Container status; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Paused,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    /// Parse from Docker API state string (e.g. "running", "exited").
    pub fn from_docker(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => ContainerStatus::Running,
            "exited" | "created" | "dead" => ContainerStatus::Stopped,
            "paused" => ContainerStatus::Paused,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// Image reference split into repository, tag and optional pinned digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub const LATEST: &'static str = "latest";

    /// Parse "registry:5000/ns/repo:tag@sha256:..". A missing tag means "latest".
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };
        // A ':' before the last '/' belongs to a registry port, not a tag.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], &name[split + 1..])
            }
            None => (name, ""),
        };
        let tag = if tag.is_empty() && digest.is_none() {
            Self::LATEST
        } else {
            tag
        };
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        }
    }

    /// The mutable "latest" alias (or no tag at all).
    pub fn is_latest(&self) -> bool {
        self.digest.is_none() && self.tag.eq_ignore_ascii_case(Self::LATEST)
    }

    /// Pinned to a digest with no tag: the content can never change under this reference.
    pub fn is_digest_pinned(&self) -> bool {
        self.tag.is_empty() && self.digest.is_some()
    }

    /// "repo:tag" without the digest, as accepted by image pull.
    pub fn name_with_tag(&self) -> String {
        if self.tag.is_empty() {
            self.repository.clone()
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }

    /// Reference to pull the exact image this names: "repo@digest" for digest-pinned
    /// references, "repo:tag" otherwise.
    pub fn pull_reference(&self) -> String {
        match &self.digest {
            Some(digest) if self.tag.is_empty() => format!("{}@{}", self.repository, digest),
            _ => self.name_with_tag(),
        }
    }

    /// Human-readable version: the tag, or the short digest of a digest-pinned reference.
    pub fn version_label(&self) -> Option<String> {
        if !self.tag.is_empty() {
            return Some(self.tag.clone());
        }
        self.digest.as_deref().map(|d| short_digest(d).to_string())
    }
}

/// First 12 hex characters of a content digest, as the engine shows ids.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.get(..12).unwrap_or(hex)
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name_with_tag())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Stable identity of a container across recreation: compose project + container name.
/// The engine assigns a fresh container id on every recreate, so the id is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub stack: Option<String>,
    pub name: String,
}

impl IdentityKey {
    pub fn new(stack: Option<&str>, name: &str) -> Self {
        Self {
            stack: stack.map(str::to_string),
            name: name.trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => write!(f, "{}/{}", stack, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Compose membership, read from container labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMembership {
    pub project: String,
    pub service: Option<String>,
    pub container_number: Option<u32>,
    /// Id of the managed stack with the same name, when the remote API knows one.
    pub stack_id: Option<StackId>,
}

impl StackMembership {
    /// `None` when the project label is absent or empty: the container is standalone.
    pub fn from_labels(labels: &HashMap<String, String>) -> Option<Self> {
        let project = labels.get(COMPOSE_PROJECT_LABEL)?.trim();
        if project.is_empty() {
            return None;
        }
        Some(Self {
            project: project.to_string(),
            service: labels.get(COMPOSE_SERVICE_LABEL).cloned(),
            container_number: labels
                .get(COMPOSE_NUMBER_LABEL)
                .and_then(|n| n.parse().ok()),
            stack_id: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Whether the container was seen in the latest refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Presence {
    Present,
    /// Absent for `cycles` consecutive refreshes, still within the grace period.
    Missing { cycles: u32 },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub key: IdentityKey,
    pub id: String,
    pub name: String,
    pub endpoint_id: EndpointId,
    pub image: ImageRef,
    /// Local image id (content digest) the container runs.
    pub image_id: Option<String>,
    pub status: ContainerStatus,
    pub metrics: Option<ResourceMetrics>,
    pub created_at: Option<DateTime<Utc>>,
    /// Start time of the current run; uptime is measured from here.
    pub running_since: Option<DateTime<Utc>>,
    pub stack: Option<StackMembership>,
    pub presence: Presence,
    pub observed_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn is_present(&self) -> bool {
        self.presence != Presence::Removed
    }

    pub fn stack_id(&self) -> Option<StackId> {
        self.stack.as_ref().and_then(|s| s.stack_id)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.stack.as_ref().and_then(|s| s.service.as_deref())
    }
}
