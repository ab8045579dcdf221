// Stack force-update operation state and its result record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContainerStatus, EndpointId, StackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackUpdateState {
    Requested,
    FetchingDefinition,
    Stopping,
    Deleting,
    Redeploying,
    AwaitingHealthy,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl StackUpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StackUpdateState::Succeeded
                | StackUpdateState::PartiallyFailed
                | StackUpdateState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackUpdateOutcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl From<StackUpdateOutcome> for StackUpdateState {
    fn from(outcome: StackUpdateOutcome) -> Self {
        match outcome {
            StackUpdateOutcome::Succeeded => StackUpdateState::Succeeded,
            StackUpdateOutcome::PartiallyFailed => StackUpdateState::PartiallyFailed,
            StackUpdateOutcome::Failed => StackUpdateState::Failed,
        }
    }
}

/// Result of one best-effort step against one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    NotAttempted,
    Ok,
    Failed { reason: String },
}

impl StepStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepStatus::Ok)
    }

    pub fn was_attempted(&self) -> bool {
        !matches!(self, StepStatus::NotAttempted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// AwaitingHealthy has not concluded for this container.
    Pending,
    Healthy,
    /// Present but not running when the timeout elapsed.
    Timeout,
    /// Not present at all after the redeploy.
    Missing,
    /// The run ended before AwaitingHealthy.
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerReport {
    pub name: String,
    pub service: Option<String>,
    /// Container id before the update; `None` for containers that first appeared after redeploy.
    pub previous_id: Option<String>,
    /// Container id observed during AwaitingHealthy.
    pub current_id: Option<String>,
    pub stop: StepStatus,
    pub delete: StepStatus,
    pub health: HealthStatus,
    pub final_status: ContainerStatus,
}

impl ContainerReport {
    pub fn new(name: String, service: Option<String>, previous_id: Option<String>) -> Self {
        Self {
            name,
            service,
            previous_id,
            current_id: None,
            stop: StepStatus::NotAttempted,
            delete: StepStatus::NotAttempted,
            health: HealthStatus::NotChecked,
            final_status: ContainerStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployReport {
    pub attempts: u32,
    pub status: StepStatus,
}

/// Live state of a running operation (for busy checks and progress reporting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackUpdateOperation {
    pub endpoint_id: EndpointId,
    pub stack_id: StackId,
    pub stack_name: Option<String>,
    pub state: StackUpdateState,
    pub started_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub containers: Vec<ContainerReport>,
    pub redeploy: RedeployReport,
}

impl StackUpdateOperation {
    /// Whether the stack may have been touched. A run caught mid-step in Stopping or later
    /// counts as destructive even before that step reported anything.
    pub fn destructive_actions_taken(&self) -> bool {
        matches!(
            self.state,
            StackUpdateState::Stopping
                | StackUpdateState::Deleting
                | StackUpdateState::Redeploying
                | StackUpdateState::AwaitingHealthy
        ) || self
            .containers
            .iter()
            .any(|c| c.stop.was_attempted() || c.delete.was_attempted())
            || self.redeploy.status.was_attempted()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackUpdateResult {
    pub endpoint_id: EndpointId,
    pub stack_id: StackId,
    pub stack_name: Option<String>,
    pub outcome: StackUpdateOutcome,
    /// State the run was in when it failed.
    pub failed_at: Option<StackUpdateState>,
    pub error: Option<String>,
    /// Whether any stop or delete was attempted. `false` on failure means nothing was touched.
    pub destructive_actions_taken: bool,
    pub redeploy: RedeployReport,
    pub containers: Vec<ContainerReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StackUpdateResult {
    pub fn container(&self, name: &str) -> Option<&ContainerReport> {
        self.containers
            .iter()
            .find(|c| c.name == name || c.service.as_deref() == Some(name))
    }
}

/// Reply to a stack update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StackUpdateResponse {
    /// Another operation on the stack is active; nothing was done.
    Busy(StackUpdateOperation),
    Finished(StackUpdateResult),
}
