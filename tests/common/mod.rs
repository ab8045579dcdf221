// Shared test helpers: a scriptable in-memory management API.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stackpilot::error::RemoteError;
use stackpilot::models::*;
use stackpilot::remote::*;
use stackpilot::service::{ServiceSettings, StackPilot};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const ENDPOINT: EndpointId = 1;

/// Service of a stack as the fake recreates it on redeploy.
#[derive(Debug, Clone)]
struct ServiceTemplate {
    name: String,
    service: String,
    image: String,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<EndpointId, Vec<RemoteContainer>>,
    stacks: Vec<RemoteStack>,
    definitions: HashMap<StackId, StackDefinition>,
    templates: HashMap<StackId, Vec<ServiceTemplate>>,
    /// Status recreated containers get, per service. Default: running.
    redeploy_status: HashMap<String, ContainerStatus>,
    /// Services the redeploy does not bring back.
    redeploy_lost: HashSet<String>,
    images: HashMap<String, ImageMetadata>,
    stats: Option<ResourceMetrics>,
    next_errors: HashMap<&'static str, VecDeque<RemoteError>>,
    always_errors: HashMap<&'static str, RemoteError>,
    redeploy_payloads: Vec<(StackId, bool)>,
    pulls: Vec<String>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    /// Call number of an operation at which the fake panics.
    panics: Mutex<HashMap<&'static str, usize>>,
    next_id: AtomicU64,
}

pub fn labels(project: &str, service: &str) -> HashMap<String, String> {
    HashMap::from([
        (COMPOSE_PROJECT_LABEL.to_string(), project.to_string()),
        (COMPOSE_SERVICE_LABEL.to_string(), service.to_string()),
        (COMPOSE_NUMBER_LABEL.to_string(), "1".to_string()),
    ])
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add a standalone container and return its id.
    pub fn add_container(&self, endpoint: EndpointId, name: &str, image: &str) -> String {
        self.add_container_with(endpoint, name, image, HashMap::new(), ContainerStatus::Running)
    }

    pub fn add_container_with(
        &self,
        endpoint: EndpointId,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        status: ContainerStatus,
    ) -> String {
        let id = self.fresh_id("c");
        self.state()
            .containers
            .entry(endpoint)
            .or_default()
            .push(RemoteContainer {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                image_id: Some(format!("sha256:{id}")),
                status,
                labels,
                created_at: Some(Utc::now()),
            });
        id
    }

    /// Add a managed stack with one running container per service, named `{stack}-{service}-1`.
    pub fn add_stack(&self, endpoint: EndpointId, id: StackId, name: &str, services: &[&str]) {
        let templates: Vec<ServiceTemplate> = services
            .iter()
            .map(|s| ServiceTemplate {
                name: format!("{name}-{s}-1"),
                service: s.to_string(),
                image: format!("team/{s}:v1"),
            })
            .collect();
        for t in &templates {
            self.add_container_with(
                endpoint,
                &t.name,
                &t.image,
                labels(name, &t.service),
                ContainerStatus::Running,
            );
        }
        let mut state = self.state();
        state.stacks.push(RemoteStack {
            id,
            name: name.to_string(),
            endpoint_id: endpoint,
            active: true,
        });
        state.definitions.insert(
            id,
            StackDefinition {
                stack_id: id,
                name: name.to_string(),
                compose: format!(
                    "services:\n{}",
                    services
                        .iter()
                        .map(|s| format!("  {s}:\n    image: team/{s}:v1\n"))
                        .collect::<String>()
                ),
                env: vec![EnvVar {
                    name: "TZ".into(),
                    value: "UTC".into(),
                }],
            },
        );
        state.templates.insert(id, templates);
    }

    pub fn set_compose(&self, stack_id: StackId, compose: &str) {
        if let Some(d) = self.state().definitions.get_mut(&stack_id) {
            d.compose = compose.to_string();
        }
    }

    /// Recreate a container under a new id, keeping name and labels.
    pub fn recreate(&self, endpoint: EndpointId, name: &str) -> String {
        let id = self.fresh_id("r");
        let mut state = self.state();
        if let Some(c) = state
            .containers
            .get_mut(&endpoint)
            .and_then(|list| list.iter_mut().find(|c| c.name == name))
        {
            c.id = id.clone();
        }
        id
    }

    pub fn remove_container(&self, endpoint: EndpointId, name: &str) {
        if let Some(list) = self.state().containers.get_mut(&endpoint) {
            list.retain(|c| c.name != name);
        }
    }

    pub fn set_status(&self, endpoint: EndpointId, name: &str, status: ContainerStatus) {
        if let Some(c) = self
            .state()
            .containers
            .get_mut(&endpoint)
            .and_then(|list| list.iter_mut().find(|c| c.name == name))
        {
            c.status = status;
        }
    }

    /// Status containers of `service` get when the stack is redeployed.
    pub fn on_redeploy(&self, service: &str, status: ContainerStatus) {
        self.state()
            .redeploy_status
            .insert(service.to_string(), status);
    }

    /// Containers of `service` are not recreated when the stack is redeployed.
    pub fn lose_on_redeploy(&self, service: &str) {
        self.state().redeploy_lost.insert(service.to_string());
    }

    pub fn set_image(&self, reference: &str, meta: ImageMetadata) {
        self.state().images.insert(reference.to_string(), meta);
    }

    pub fn set_stats(&self, metrics: ResourceMetrics) {
        self.state().stats = Some(metrics);
    }

    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        self.state()
            .next_errors
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(&self, op: &'static str, err: RemoteError) {
        self.state().always_errors.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.next_errors.clear();
        state.always_errors.clear();
    }

    /// Panic on the `n`th call of `op` (counting from 1), like a bug inside the client would.
    pub fn panic_on_call(&self, op: &'static str, n: usize) {
        self.panics.lock().unwrap().insert(op, n);
    }

    pub fn redeploys(&self) -> Vec<(StackId, bool)> {
        self.state().redeploy_payloads.clone()
    }

    /// Hold every call of `op` until `release` is called.
    /// References pulled through `pull_image`, in call order.
    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    pub fn gate(&self, op: &'static str) {
        self.gates
            .lock()
            .unwrap()
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: &'static str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(op) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Calls of every operation.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Count the call, wait at its gate if any, then apply scripted failures.
    async fn enter(&self, op: &'static str) -> Result<(), RemoteError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(op).or_default();
            *count += 1;
            *count
        };
        if self.panics.lock().unwrap().get(op) == Some(&call) {
            panic!("{op} call {call} blew up");
        }
        let gate = self.gates.lock().unwrap().get(op).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        let mut state = self.state();
        if let Some(err) = state.next_errors.get_mut(op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        if let Some(err) = state.always_errors.get(op) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn find(&self, endpoint: EndpointId, id: &str) -> Option<RemoteContainer> {
        self.state()
            .containers
            .get(&endpoint)
            .and_then(|list| list.iter().find(|c| c.id == id).cloned())
    }
}

/// Wait until `op` was called `n` times, yielding to other tasks.
pub async fn wait_for_calls(fake: &FakeRemote, op: &str, n: usize) {
    for _ in 0..10_000 {
        if fake.count(op) >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{op} was not called {n} times (got {})", fake.count(op));
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list_containers(
        &self,
        endpoint: EndpointId,
    ) -> Result<Vec<RemoteContainer>, RemoteError> {
        self.enter("list_containers").await?;
        Ok(self
            .state()
            .containers
            .get(&endpoint)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_stacks(&self, endpoint: EndpointId) -> Result<Vec<RemoteStack>, RemoteError> {
        self.enter("list_stacks").await?;
        Ok(self
            .state()
            .stacks
            .iter()
            .filter(|s| s.endpoint_id == endpoint)
            .cloned()
            .collect())
    }

    async fn inspect_container(
        &self,
        endpoint: EndpointId,
        id: &str,
    ) -> Result<ContainerDetail, RemoteError> {
        self.enter("inspect_container").await?;
        let c = self
            .find(endpoint, id)
            .ok_or_else(|| RemoteError::NotFound(format!("container {id}")))?;
        let started_at: Option<DateTime<Utc>> =
            (c.status == ContainerStatus::Running).then(Utc::now);
        Ok(ContainerDetail {
            id: c.id,
            name: c.name,
            image: c.image,
            image_id: c.image_id,
            status: c.status,
            labels: c.labels,
            created_at: c.created_at,
            started_at,
        })
    }

    async fn container_stats(
        &self,
        _endpoint: EndpointId,
        id: &str,
    ) -> Result<ResourceMetrics, RemoteError> {
        self.enter("container_stats").await?;
        self.state()
            .stats
            .clone()
            .ok_or_else(|| RemoteError::Decode(format!("stats of container {id}: no cpu sample")))
    }

    async fn start_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        self.enter("start_container").await?;
        let mut state = self.state();
        let c = state
            .containers
            .get_mut(&endpoint)
            .and_then(|list| list.iter_mut().find(|c| c.id == id))
            .ok_or_else(|| RemoteError::NotFound(format!("container {id}")))?;
        c.status = ContainerStatus::Running;
        Ok(())
    }

    async fn restart_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        self.enter("restart_container").await?;
        let mut state = self.state();
        let c = state
            .containers
            .get_mut(&endpoint)
            .and_then(|list| list.iter_mut().find(|c| c.id == id))
            .ok_or_else(|| RemoteError::NotFound(format!("container {id}")))?;
        c.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        self.enter("stop_container").await?;
        let mut state = self.state();
        let c = state
            .containers
            .get_mut(&endpoint)
            .and_then(|list| list.iter_mut().find(|c| c.id == id))
            .ok_or_else(|| RemoteError::NotFound(format!("container {id}")))?;
        c.status = ContainerStatus::Stopped;
        Ok(())
    }

    async fn delete_container(&self, endpoint: EndpointId, id: &str) -> Result<(), RemoteError> {
        self.enter("delete_container").await?;
        if let Some(list) = self.state().containers.get_mut(&endpoint) {
            list.retain(|c| c.id != id);
        }
        Ok(())
    }

    async fn get_stack_definition(
        &self,
        _endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<StackDefinition, RemoteError> {
        self.enter("get_stack_definition").await?;
        self.state()
            .definitions
            .get(&stack_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("stack {stack_id}")))
    }

    async fn redeploy_stack(
        &self,
        endpoint: EndpointId,
        definition: &StackDefinition,
        force_pull: bool,
    ) -> Result<(), RemoteError> {
        self.enter("redeploy_stack").await?;
        let templates = {
            let mut state = self.state();
            state
                .redeploy_payloads
                .push((definition.stack_id, force_pull));
            state
                .templates
                .get(&definition.stack_id)
                .cloned()
                .unwrap_or_default()
        };
        let mut state = self.state();
        let list = state.containers.entry(endpoint).or_default();
        list.retain(|c| !c.is_member_of(&definition.name));
        let mut recreated = Vec::new();
        for t in templates {
            recreated.push((t, self.fresh_id("n")));
        }
        let statuses = state.redeploy_status.clone();
        let lost = state.redeploy_lost.clone();
        let list = state.containers.entry(endpoint).or_default();
        for (t, id) in recreated.into_iter().filter(|(t, _)| !lost.contains(&t.service)) {
            list.push(RemoteContainer {
                image_id: Some(format!("sha256:{id}")),
                id,
                name: t.name.clone(),
                image: t.image.clone(),
                status: statuses
                    .get(&t.service)
                    .copied()
                    .unwrap_or(ContainerStatus::Running),
                labels: labels(&definition.name, &t.service),
                created_at: Some(Utc::now()),
            });
        }
        Ok(())
    }

    async fn start_stack(&self, endpoint: EndpointId, stack_id: StackId) -> Result<(), RemoteError> {
        self.enter("start_stack").await?;
        let mut state = self.state();
        let name = state
            .stacks
            .iter()
            .find(|s| s.id == stack_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("stack {stack_id}")))?;
        if let Some(list) = state.containers.get_mut(&endpoint) {
            for c in list.iter_mut().filter(|c| c.is_member_of(&name)) {
                c.status = ContainerStatus::Running;
            }
        }
        Ok(())
    }

    async fn stop_stack(&self, endpoint: EndpointId, stack_id: StackId) -> Result<(), RemoteError> {
        self.enter("stop_stack").await?;
        let mut state = self.state();
        let name = state
            .stacks
            .iter()
            .find(|s| s.id == stack_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("stack {stack_id}")))?;
        if let Some(list) = state.containers.get_mut(&endpoint) {
            for c in list.iter_mut().filter(|c| c.is_member_of(&name)) {
                c.status = ContainerStatus::Stopped;
            }
        }
        Ok(())
    }

    async fn pull_image(&self, _endpoint: EndpointId, image: &ImageRef) -> Result<(), RemoteError> {
        self.enter("pull_image").await?;
        self.state().pulls.push(image.pull_reference());
        Ok(())
    }

    async fn get_image_metadata(
        &self,
        _endpoint: EndpointId,
        image: &ImageRef,
    ) -> Result<ImageMetadata, RemoteError> {
        self.enter("get_image_metadata").await?;
        Ok(self
            .state()
            .images
            .get(&image.name_with_tag())
            .cloned()
            .unwrap_or_default())
    }
}

pub fn pilot_with(fake: &Arc<FakeRemote>, settings: ServiceSettings) -> Arc<StackPilot> {
    Arc::new(StackPilot::new(
        fake.clone(),
        vec![Endpoint::new(ENDPOINT, Some("local"), "http://portainer.test")],
        settings,
        None,
    ))
}

pub fn pilot(fake: &Arc<FakeRemote>) -> Arc<StackPilot> {
    pilot_with(fake, ServiceSettings::default())
}
