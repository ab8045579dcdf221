// Typed failures returned by the remote API client.

use serde::{Deserialize, Serialize};

/// Coarse failure class, carried on degraded snapshots and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Auth,
    NotFound,
    RateLimited,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("remote API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) => FailureKind::Network,
            RemoteError::Auth(_) => FailureKind::Auth,
            RemoteError::NotFound(_) => FailureKind::NotFound,
            RemoteError::RateLimited(_) => FailureKind::RateLimited,
            RemoteError::Api { .. } | RemoteError::Decode(_) => FailureKind::Remote,
        }
    }

    /// Whether repeating the same request later can reasonably succeed.
    /// Auth and not-found need operator action; 4xx other than 408/429 are request errors.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::RateLimited(_) => true,
            RemoteError::Api { status, .. } => *status >= 500 || *status == 408,
            RemoteError::Auth(_) | RemoteError::NotFound(_) | RemoteError::Decode(_) => false,
        }
    }

    /// Map a non-success HTTP status into the failure taxonomy.
    pub fn from_status(status: u16, what: &str, body: String) -> Self {
        match status {
            401 | 403 => RemoteError::Auth(format!("{what}: HTTP {status}")),
            404 => RemoteError::NotFound(what.to_string()),
            429 => RemoteError::RateLimited(what.to_string()),
            _ => RemoteError::Api { status, body },
        }
    }
}
