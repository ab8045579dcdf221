// Wire payloads of the management API and their mapping into the client's types.
// Docker-engine payloads are proxied verbatim, so they decode into bollard's API models.

use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageInspect};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ContainerDetail, EnvVar, ImageMetadata, RemoteContainer, RemoteStack};
use crate::models::{ContainerStatus, EndpointId, ImageRef, StackId};

/// Portainer stack status: 1 = active, 2 = inactive.
const STACK_STATUS_ACTIVE: u8 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct StackPayload {
    pub id: StackId,
    pub name: String,
    pub endpoint_id: EndpointId,
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default)]
    pub stack_file_content: Option<String>,
}

impl From<StackPayload> for RemoteStack {
    fn from(s: StackPayload) -> Self {
        RemoteStack {
            id: s.id,
            name: s.name,
            endpoint_id: s.endpoint_id,
            active: s.status.is_none_or(|st| st == STACK_STATUS_ACTIVE),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct StackFilePayload {
    #[serde(default)]
    pub stack_file_content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StackUpdatePayload<'a> {
    pub stack_file_content: &'a str,
    pub env: &'a [EnvVar],
    pub prune: bool,
    pub pull_image: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct AuthPayload<'a> {
    #[serde(rename = "Username")]
    pub username: &'a str,
    #[serde(rename = "Password")]
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthResponse {
    pub jwt: String,
}

/// Entry of the engine's image list; only the tags are needed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ImageListEntry {
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
}

pub(super) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        // The engine reports never-started containers as year 1.
        .filter(|t| t.timestamp() > 0)
}

pub(super) fn container_from_summary(c: ContainerSummary) -> Option<RemoteContainer> {
    let id = c.id?;
    let name = c
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    let status = c
        .state
        .map(|s| ContainerStatus::from_docker(&s.to_string()))
        .unwrap_or(ContainerStatus::Unknown);
    Some(RemoteContainer {
        name,
        image: c.image.unwrap_or_default(),
        image_id: c.image_id,
        status,
        labels: c.labels.unwrap_or_default(),
        created_at: c
            .created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        id,
    })
}

pub(super) fn detail_from_inspect(c: ContainerInspectResponse) -> Option<ContainerDetail> {
    let id = c.id?;
    let name = c
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    let (status, started_at) = match c.state {
        Some(state) => (
            state
                .status
                .map(|s| ContainerStatus::from_docker(&s.to_string()))
                .unwrap_or(ContainerStatus::Unknown),
            state.started_at.as_deref().and_then(parse_timestamp),
        ),
        None => (ContainerStatus::Unknown, None),
    };
    let (image, labels) = match c.config {
        Some(config) => (
            config.image.unwrap_or_default(),
            config.labels.unwrap_or_default(),
        ),
        None => (String::new(), Default::default()),
    };
    Some(ContainerDetail {
        name,
        image,
        image_id: c.image,
        status,
        labels,
        created_at: c.created.as_deref().and_then(parse_timestamp),
        started_at: if status == ContainerStatus::Running {
            started_at
        } else {
            None
        },
        id,
    })
}

/// Merge the inspected image with the tags the engine knows for its repository.
pub(super) fn image_metadata(
    image: &ImageRef,
    inspect: ImageInspect,
    listed: &[ImageListEntry],
) -> ImageMetadata {
    let prefix = format!("{}:", image.repository);
    let mut tags: Vec<String> = inspect
        .repo_tags
        .iter()
        .flatten()
        .chain(listed.iter().flat_map(|e| e.repo_tags.iter().flatten()))
        .filter_map(|t| t.strip_prefix(&prefix))
        .map(str::to_string)
        .collect();
    tags.sort();
    tags.dedup();
    ImageMetadata {
        tags,
        created_at: inspect.created.as_deref().and_then(parse_timestamp),
        digest: inspect.id,
    }
}

/// The pull endpoint answers 200 and reports registry errors inside the progress stream.
pub(super) fn pull_stream_error(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find_map(|v| {
            v.get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_maps_names_labels_and_state() {
        let c: ContainerSummary = serde_json::from_str(
            r#"{
                "Id": "abc",
                "Names": ["/demo-web-1"],
                "Image": "nginx:1.25",
                "ImageID": "sha256:111",
                "Created": 1700000000,
                "State": "running",
                "Labels": {"com.docker.compose.project": "demo", "com.docker.compose.service": "web"}
            }"#,
        )
        .unwrap();
        let r = container_from_summary(c).unwrap();
        assert_eq!(r.id, "abc");
        assert_eq!(r.name, "demo-web-1");
        assert_eq!(r.status, ContainerStatus::Running);
        assert_eq!(r.image_id.as_deref(), Some("sha256:111"));
        assert!(r.is_member_of("Demo"));
        assert_eq!(r.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn inspect_maps_started_at_only_when_running() {
        let c: ContainerInspectResponse = serde_json::from_str(
            r#"{
                "Id": "abc",
                "Name": "/db",
                "Created": "2024-01-01T10:00:00.123456789Z",
                "Image": "sha256:222",
                "State": {"Status": "exited", "StartedAt": "2024-01-01T10:00:01Z"},
                "Config": {"Image": "postgres:16", "Labels": {}}
            }"#,
        )
        .unwrap();
        let d = detail_from_inspect(c).unwrap();
        assert_eq!(d.name, "db");
        assert_eq!(d.status, ContainerStatus::Stopped);
        assert!(d.started_at.is_none());
        assert_eq!(d.image, "postgres:16");
        assert!(d.created_at.is_some());
    }

    #[test]
    fn zero_time_is_treated_as_absent() {
        assert!(parse_timestamp("0001-01-01T00:00:00Z").is_none());
        assert!(parse_timestamp("not a time").is_none());
    }

    #[test]
    fn image_metadata_collects_repository_tags() {
        let image = ImageRef::parse("team/app:v2");
        let inspect: ImageInspect = serde_json::from_str(
            r#"{"Id": "sha256:333", "RepoTags": ["team/app:v2"], "Created": "2024-05-01T00:00:00Z"}"#,
        )
        .unwrap();
        let listed = vec![
            ImageListEntry {
                repo_tags: Some(vec!["team/app:v3".into(), "other/app:v9".into()]),
            },
            ImageListEntry { repo_tags: None },
        ];
        let meta = image_metadata(&image, inspect, &listed);
        assert_eq!(meta.tags, vec!["v2".to_string(), "v3".to_string()]);
        assert_eq!(meta.digest.as_deref(), Some("sha256:333"));
        assert!(meta.created_at.is_some());
    }

    #[test]
    fn pull_stream_error_is_detected() {
        let body = "{\"status\":\"Pulling from team/app\"}\n{\"error\":\"toomanyrequests: rate limit\"}\n";
        assert_eq!(
            pull_stream_error(body).as_deref(),
            Some("toomanyrequests: rate limit")
        );
        assert!(pull_stream_error("{\"status\":\"Downloaded newer image\"}").is_none());
    }

    #[test]
    fn stack_payload_status() {
        let s: StackPayload =
            serde_json::from_str(r#"{"Id": 4, "Name": "demo", "EndpointId": 1, "Status": 2}"#)
                .unwrap();
        let r: RemoteStack = s.into();
        assert!(!r.active);
        assert_eq!(r.id, 4);
    }
}
