// Managed endpoint identity

use serde::{Deserialize, Serialize};

use super::EndpointId;

/// One Docker host/cluster reachable through the remote management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    /// Base URL of the management API the endpoint is reached through.
    pub base_url: String,
}

impl Endpoint {
    pub fn new(id: EndpointId, name: Option<&str>, base_url: &str) -> Self {
        Self {
            id,
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| format!("endpoint-{id}")),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}
