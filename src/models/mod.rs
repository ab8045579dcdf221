// Domain models shared by the coordinator, detector and orchestrator

mod container;
mod endpoint;
mod operation;
mod snapshot;
mod stack;
mod update;

/// Numeric id of a remote management endpoint.
pub type EndpointId = u32;
/// Numeric id of a managed stack.
pub type StackId = u64;

pub use container::{
    COMPOSE_NUMBER_LABEL, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, ContainerRecord,
    ContainerStatus, IdentityKey, ImageRef, Presence, ResourceMetrics, StackMembership,
    short_digest,
};
pub use endpoint::Endpoint;
pub use operation::{
    ContainerReport, HealthStatus, RedeployReport, StackUpdateOperation, StackUpdateOutcome,
    StackUpdateResponse, StackUpdateResult, StackUpdateState, StepStatus,
};
pub use snapshot::{Degradation, Snapshot, SnapshotEvent};
pub use stack::{StackRecord, StackStatus};
pub use update::{UpdateCheck, UpdateCheckEntry, UpdateSource};
