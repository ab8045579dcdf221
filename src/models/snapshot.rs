// Point-in-time view of one endpoint, plus the change events published on refresh

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContainerRecord, EndpointId, IdentityKey, StackId, StackRecord};
use crate::error::FailureKind;

/// Why the retained snapshot is not current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    pub kind: FailureKind,
    pub message: String,
    /// First failed refresh of the current failure streak.
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub endpoint_id: EndpointId,
    /// Bumped on every replace, successful or degraded.
    pub version: u64,
    /// Time of the last successful refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Sorted by identity key.
    pub containers: Vec<ContainerRecord>,
    pub stacks: Vec<StackRecord>,
    pub degraded: Option<Degradation>,
}

impl Snapshot {
    pub fn empty(endpoint_id: EndpointId) -> Self {
        Self {
            endpoint_id,
            version: 0,
            refreshed_at: None,
            containers: Vec::new(),
            stacks: Vec::new(),
            degraded: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn container(&self, key: &IdentityKey) -> Option<&ContainerRecord> {
        self.containers
            .binary_search_by(|c| c.key.cmp(key))
            .ok()
            .map(|i| &self.containers[i])
    }

    /// Lookup by (ephemeral) container id or by container name.
    pub fn container_by_id(&self, id: &str) -> Option<&ContainerRecord> {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .or_else(|| self.containers.iter().find(|c| c.name == id))
    }

    pub fn stack(&self, id: StackId) -> Option<&StackRecord> {
        self.stacks.iter().find(|s| s.id == id)
    }

    /// Containers that are not marked removed.
    pub fn present_containers(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.containers.iter().filter(|c| c.is_present())
    }
}

/// Published on the coordinator's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotEvent {
    #[serde(rename_all = "camelCase")]
    Refreshed {
        endpoint_id: EndpointId,
        version: u64,
        added: Vec<IdentityKey>,
        removed: Vec<IdentityKey>,
        changed: Vec<IdentityKey>,
    },
    #[serde(rename_all = "camelCase")]
    Degraded {
        endpoint_id: EndpointId,
        kind: FailureKind,
        message: String,
    },
    /// Needs operator action; retrying will not help without new credentials.
    #[serde(rename_all = "camelCase")]
    AuthFailed {
        endpoint_id: EndpointId,
        message: String,
    },
}
