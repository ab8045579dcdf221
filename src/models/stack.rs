// Stack records: managed compose stacks and their member containers

use serde::{Deserialize, Serialize};

use super::{ContainerStatus, EndpointId, StackId};

/// Aggregate of member statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    /// Every member is running.
    Running,
    /// Some members are running, some are not.
    Partial,
    /// No member is running.
    Stopped,
    /// The stack has no observed members.
    Empty,
}

impl StackStatus {
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ContainerStatus>,
    {
        let (mut total, mut running) = (0usize, 0usize);
        for s in statuses {
            total += 1;
            if s == ContainerStatus::Running {
                running += 1;
            }
        }
        match (total, running) {
            (0, _) => StackStatus::Empty,
            (t, r) if t == r => StackStatus::Running,
            (_, 0) => StackStatus::Stopped,
            _ => StackStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRecord {
    pub id: StackId,
    pub name: String,
    pub endpoint_id: EndpointId,
    /// Member container ids, ordered by service name.
    pub members: Vec<String>,
    pub status: StackStatus,
}
