// Portainer REST API client (reqwest). Docker calls go through the endpoint's docker proxy.

use async_trait::async_trait;
use bollard::models::{
    ContainerInspectResponse, ContainerStatsResponse, ContainerSummary, ImageInspect,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::wire::{self, AuthPayload, AuthResponse, ImageListEntry, StackFilePayload, StackPayload};
use super::{
    ContainerDetail, ImageMetadata, RemoteClient, RemoteContainer, RemoteStack, StackDefinition,
};
use crate::error::RemoteError;
use crate::models::{EndpointId, ImageRef, ResourceMetrics, StackId};

/// How requests are signed.
#[derive(Clone)]
pub enum Credentials {
    ApiKey(String),
    Password { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(..)"),
            Credentials::Password { username, .. } => {
                write!(f, "Password {{ username: {username:?}, .. }}")
            }
        }
    }
}

pub struct PortainerClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    /// JWT from /api/auth when signing with username/password.
    token: RwLock<Option<String>>,
}

impl PortainerClient {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        timeout: Duration,
        ssl_verify: bool,
    ) -> anyhow::Result<Self> {
        let parsed = Url::parse(base_url)?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "unsupported URL scheme: {}",
            parsed.scheme()
        );
        let base_url = base_url.trim_end_matches('/').to_string();
        if !ssl_verify {
            info!("TLS certificate verification disabled for {}", base_url);
        }
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!ssl_verify)
            .user_agent(crate::version::user_agent())
            .build()?;
        Ok(Self {
            http,
            base_url,
            credentials,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        // Appended rather than joined so a base URL with a path prefix keeps it.
        Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| RemoteError::Decode(format!("invalid request path {path}: {e}")))
    }

    fn docker_path(endpoint: EndpointId, rest: &str) -> String {
        format!("/api/endpoints/{endpoint}/docker/{rest}")
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, RemoteError> {
        let resp = self
            .http
            .post(self.url("/api/auth")?)
            .json(&AuthPayload { username, password })
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(RemoteError::Auth(format!("login rejected: HTTP {status}")));
        }
        let auth: AuthResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("auth response: {e}")))?;
        info!("Authenticated against {}", self.base_url);
        Ok(auth.jwt)
    }

    async fn sign(&self, req: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        match &self.credentials {
            Credentials::ApiKey(key) => Ok(req.header("X-API-Key", key)),
            Credentials::Password { username, password } => {
                if let Some(token) = self.token.read().await.as_ref() {
                    return Ok(req.bearer_auth(token));
                }
                let mut slot = self.token.write().await;
                let token = match slot.as_ref() {
                    Some(t) => t.clone(),
                    None => {
                        let t = self.login(username, password).await?;
                        *slot = Some(t.clone());
                        t
                    }
                };
                Ok(req.bearer_auth(token))
            }
        }
    }

    /// Send a signed request. An expired JWT is re-acquired once on HTTP 401.
    async fn send<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut relogged = false;
        loop {
            let req = self.sign(build(&self.http)).await?;
            let resp = req.send().await.map_err(network_error)?;
            if resp.status() == StatusCode::UNAUTHORIZED
                && !relogged
                && matches!(self.credentials, Credentials::Password { .. })
            {
                debug!("JWT rejected, authenticating again");
                *self.token.write().await = None;
                relogged = true;
                continue;
            }
            return Ok(resp);
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response, RemoteError> {
        let url = self.url(path)?;
        self.send(|http| http.request(method.clone(), url.clone()).query(query))
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<T, RemoteError> {
        let resp = expect_success(self.request(Method::GET, path, query).await?, what).await?;
        resp.json()
            .await
            .map_err(|e| RemoteError::Decode(format!("{what}: {e}")))
    }

    async fn stack_payloads(&self) -> Result<Vec<StackPayload>, RemoteError> {
        self.get_json("/api/stacks", &[], "stack list").await
    }

    /// Pull `reference` through the engine. The engine answers 200 and reports registry
    /// failures inside the progress stream, so the stream is read to the end.
    async fn pull(&self, endpoint: EndpointId, reference: &str) -> Result<(), RemoteError> {
        let what = format!("image {reference}");
        let resp = self
            .request(
                Method::POST,
                &Self::docker_path(endpoint, "images/create"),
                &[("fromImage", reference)],
            )
            .await?;
        let resp = expect_success(resp, &what).await?;
        let body = resp.text().await.map_err(network_error)?;
        if let Some(err) = wire::pull_stream_error(&body) {
            if err.contains("toomanyrequests") || err.contains("rate limit") {
                return Err(RemoteError::RateLimited(format!("{what}: {err}")));
            }
            if err.contains("not found") || err.contains("manifest unknown") {
                return Err(RemoteError::NotFound(what));
            }
            warn!(error = %err, "image pull reported an error");
            return Err(RemoteError::Api {
                status: 200,
                body: err,
            });
        }
        Ok(())
    }
}

fn network_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

async fn expect_success(resp: Response, what: &str) -> Result<Response, RemoteError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status, what, body))
}

/// Accept success plus the extra statuses that mean "already in the requested state".
async fn expect_status(resp: Response, ok: &[u16], what: &str) -> Result<(), RemoteError> {
    let status = resp.status().as_u16();
    if resp.status().is_success() || ok.contains(&status) {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status, what, body))
}

#[async_trait]
impl RemoteClient for PortainerClient {
    #[instrument(skip(self), fields(client = "portainer", operation = "list_containers"))]
    async fn list_containers(
        &self,
        endpoint: EndpointId,
    ) -> Result<Vec<RemoteContainer>, RemoteError> {
        let what = format!("containers of endpoint {endpoint}");
        let raw: Vec<ContainerSummary> = self
            .get_json(
                &Self::docker_path(endpoint, "containers/json"),
                &[("all", "1")],
                &what,
            )
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(wire::container_from_summary)
            .collect())
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "list_stacks"))]
    async fn list_stacks(&self, endpoint: EndpointId) -> Result<Vec<RemoteStack>, RemoteError> {
        Ok(self
            .stack_payloads()
            .await?
            .into_iter()
            .filter(|s| s.endpoint_id == endpoint)
            .map(RemoteStack::from)
            .collect())
    }

    async fn inspect_container(
        &self,
        endpoint: EndpointId,
        id: &str,
    ) -> Result<ContainerDetail, RemoteError> {
        let what = format!("container {id}");
        let raw: ContainerInspectResponse = self
            .get_json(
                &Self::docker_path(endpoint, &format!("containers/{id}/json")),
                &[],
                &what,
            )
            .await?;
        wire::detail_from_inspect(raw)
            .ok_or_else(|| RemoteError::Decode(format!("{what}: inspect without id")))
    }

    async fn container_stats(
        &self,
        endpoint: EndpointId,
        id: &str,
    ) -> Result<ResourceMetrics, RemoteError> {
        let what = format!("stats of container {id}");
        let raw: ContainerStatsResponse = self
            .get_json(
                &Self::docker_path(endpoint, &format!("containers/{id}/stats")),
                &[("stream", "false")],
                &what,
            )
            .await?;
        super::metrics_from_stats(&raw)
            .ok_or_else(|| RemoteError::Decode(format!("{what}: no cpu sample")))
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "start_container"))]
    async fn start_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        let path = Self::docker_path(endpoint, &format!("containers/{id}/start"));
        let resp = self.request(Method::POST, &path, &[]).await?;
        // 304: already running
        expect_status(resp, &[304], &format!("container {id}")).await
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "restart_container"))]
    async fn restart_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        let path = Self::docker_path(endpoint, &format!("containers/{id}/restart"));
        let resp = self.request(Method::POST, &path, &[]).await?;
        expect_status(resp, &[], &format!("container {id}")).await
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "stop_container"))]
    async fn stop_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        let path = Self::docker_path(endpoint, &format!("containers/{id}/stop"));
        let resp = self.request(Method::POST, &path, &[]).await?;
        // 304: already stopped
        expect_status(resp, &[304], &format!("container {id}")).await
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "delete_container"))]
    async fn delete_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        let path = Self::docker_path(endpoint, &format!("containers/{id}"));
        let resp = self
            .request(Method::DELETE, &path, &[("force", "1"), ("v", "1")])
            .await?;
        // 404: already gone
        expect_status(resp, &[404], &format!("container {id}")).await
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "get_stack_definition"))]
    async fn get_stack_definition(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<StackDefinition, RemoteError> {
        let what = format!("stack {stack_id}");
        let detail: StackPayload = self
            .get_json(&format!("/api/stacks/{stack_id}"), &[], &what)
            .await?;
        if detail.endpoint_id != endpoint {
            return Err(RemoteError::NotFound(format!(
                "stack {stack_id} on endpoint {endpoint}"
            )));
        }
        let mut compose = detail
            .stack_file_content
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if compose.is_empty() {
            debug!(stack_id, "stack detail carries no compose text, reading stack file");
            let endpoint_str = endpoint.to_string();
            let file: StackFilePayload = self
                .get_json(
                    &format!("/api/stacks/{stack_id}/file"),
                    &[("endpointId", endpoint_str.as_str())],
                    &format!("file of stack {stack_id}"),
                )
                .await?;
            compose = file.stack_file_content.trim().to_string();
        }
        Ok(StackDefinition {
            stack_id,
            name: detail.name,
            compose,
            env: detail.env.unwrap_or_default(),
        })
    }

    #[instrument(skip(self, definition), fields(client = "portainer", operation = "redeploy_stack", stack_id = definition.stack_id))]
    async fn redeploy_stack(
        &self,
        endpoint: EndpointId,
        definition: &StackDefinition,
        force_pull: bool,
    ) -> Result<(), RemoteError> {
        let url = self.url(&format!("/api/stacks/{}", definition.stack_id))?;
        let endpoint_str = endpoint.to_string();
        let payload = wire::StackUpdatePayload {
            stack_file_content: &definition.compose,
            env: &definition.env,
            prune: false,
            pull_image: force_pull,
        };
        let resp = self
            .send(|http| {
                http.put(url.clone())
                    .query(&[("endpointId", endpoint_str.as_str())])
                    .json(&payload)
            })
            .await?;
        expect_success(resp, &format!("redeploy of stack {}", definition.stack_id)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "start_stack"))]
    async fn start_stack(&self, endpoint: EndpointId, stack_id: StackId) -> Result<(), RemoteError> {
        let endpoint_str = endpoint.to_string();
        let resp = self
            .request(
                Method::POST,
                &format!("/api/stacks/{stack_id}/start"),
                &[("endpointId", endpoint_str.as_str())],
            )
            .await?;
        expect_success(resp, &format!("start of stack {stack_id}")).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(client = "portainer", operation = "stop_stack"))]
    async fn stop_stack(&self, endpoint: EndpointId, stack_id: StackId) -> Result<(), RemoteError> {
        let endpoint_str = endpoint.to_string();
        let resp = self
            .request(
                Method::POST,
                &format!("/api/stacks/{stack_id}/stop"),
                &[("endpointId", endpoint_str.as_str())],
            )
            .await?;
        expect_success(resp, &format!("stop of stack {stack_id}")).await?;
        Ok(())
    }

    #[instrument(skip(self, image), fields(client = "portainer", operation = "pull_image", image = %image))]
    async fn pull_image(&self, endpoint: EndpointId, image: &ImageRef) -> Result<(), RemoteError> {
        self.pull(endpoint, &image.pull_reference()).await
    }

    #[instrument(skip(self, image), fields(client = "portainer", operation = "get_image_metadata", image = %image))]
    async fn get_image_metadata(
        &self,
        endpoint: EndpointId,
        image: &ImageRef,
    ) -> Result<ImageMetadata, RemoteError> {
        let reference = image.name_with_tag();
        let what = format!("image {reference}");

        // Pull first: this is the registry round trip that rate limits apply to.
        self.pull(endpoint, &reference).await?;

        let inspect: ImageInspect = self
            .get_json(
                &Self::docker_path(endpoint, &format!("images/{reference}/json")),
                &[],
                &what,
            )
            .await?;
        let listed: Vec<ImageListEntry> = self
            .get_json(&Self::docker_path(endpoint, "images/json"), &[], "image list")
            .await?;
        Ok(wire::image_metadata(image, inspect, &listed))
    }
}
