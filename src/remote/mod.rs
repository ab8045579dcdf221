// Remote management API seam: what the core needs from the container-management server

mod portainer;
mod stats;
mod wire;

pub use portainer::{Credentials, PortainerClient};
pub use stats::metrics_from_stats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RemoteError;
use crate::models::{
    ContainerStatus, EndpointId, ImageRef, ResourceMetrics, StackId, StackMembership,
};

/// One entry of the container list.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: Option<String>,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteContainer {
    pub fn membership(&self) -> Option<StackMembership> {
        StackMembership::from_labels(&self.labels)
    }

    /// Whether the container belongs to the compose project `stack_name`.
    /// Compose lowercases project names, so the comparison ignores case.
    pub fn is_member_of(&self, stack_name: &str) -> bool {
        self.membership()
            .is_some_and(|m| m.project.eq_ignore_ascii_case(stack_name))
    }
}

/// Inspection data of a single container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: Option<String>,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStack {
    pub id: StackId,
    pub name: String,
    pub endpoint_id: EndpointId,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Compose text plus resolved environment of a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDefinition {
    pub stack_id: StackId,
    pub name: String,
    pub compose: String,
    pub env: Vec<EnvVar>,
}

impl StackDefinition {
    const MIN_COMPOSE_LEN: usize = 10;

    /// Compose text shorter than this after trimming cannot describe a service.
    pub fn is_deployable(&self) -> bool {
        self.compose.trim().len() >= Self::MIN_COMPOSE_LEN
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageMetadata {
    /// Tags known for the image's repository.
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub digest: Option<String>,
}

/// Authenticated, typed access to the remote management API.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// All containers of the endpoint, running or not.
    async fn list_containers(
        &self,
        endpoint: EndpointId,
    ) -> Result<Vec<RemoteContainer>, RemoteError>;

    /// Managed stacks deployed on the endpoint.
    async fn list_stacks(&self, endpoint: EndpointId) -> Result<Vec<RemoteStack>, RemoteError>;

    async fn inspect_container(
        &self,
        endpoint: EndpointId,
        id: &str,
    ) -> Result<ContainerDetail, RemoteError>;

    async fn container_stats(
        &self,
        endpoint: EndpointId,
        id: &str,
    ) -> Result<ResourceMetrics, RemoteError>;

    async fn start_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError>;

    async fn restart_container(&self, endpoint: EndpointId, id: &str)
    -> Result<(), RemoteError>;

    /// Stopping an already stopped container succeeds.
    async fn stop_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError>;

    /// Deleting an already absent container succeeds.
    async fn delete_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError>;

    async fn get_stack_definition(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<StackDefinition, RemoteError>;

    async fn redeploy_stack(
        &self,
        endpoint: EndpointId,
        definition: &StackDefinition,
        force_pull: bool,
    ) -> Result<(), RemoteError>;

    async fn start_stack(&self, endpoint: EndpointId, stack_id: StackId)
    -> Result<(), RemoteError>;

    async fn stop_stack(&self, endpoint: EndpointId, stack_id: StackId)
    -> Result<(), RemoteError>;

    /// Pull the image so the next recreate of its containers runs the newest build.
    async fn pull_image(&self, endpoint: EndpointId, image: &ImageRef) -> Result<(), RemoteError>;

    /// Registry-backed metadata. Each call counts against registry rate limits.
    async fn get_image_metadata(
        &self,
        endpoint: EndpointId,
        image: &ImageRef,
    ) -> Result<ImageMetadata, RemoteError>;
}
