// Consumer-facing facade over coordinator, detector and orchestrator.

use chrono::Duration as ChronoDuration;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::cache_repo::CacheRepo;
use crate::config::AppConfig;
use crate::coordinator::{RefreshConfig, RefreshCoordinator, SnapshotStore};
use crate::detector::{DetectorConfig, UpdateDetector};
use crate::error::RemoteError;
use crate::models::{
    Endpoint, EndpointId, Snapshot, SnapshotEvent, StackId, StackUpdateOperation,
    StackUpdateResponse, StackUpdateResult, UpdateCheck,
};
use crate::orchestrator::{OrchestratorConfig, StackUpdateOrchestrator};
use crate::remote::RemoteClient;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("container {container} not found on endpoint {endpoint}")]
    UnknownContainer {
        endpoint: EndpointId,
        container: String,
    },
    #[error("update checks are disabled")]
    UpdateChecksDisabled,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Tuning of all components, usually taken from `AppConfig`.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub refresh: RefreshConfig,
    pub event_capacity: usize,
    pub update_checks_enabled: bool,
    pub detector: DetectorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            refresh: RefreshConfig::default(),
            event_capacity: 64,
            update_checks_enabled: true,
            detector: DetectorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl From<&AppConfig> for ServiceSettings {
    fn from(c: &AppConfig) -> Self {
        Self {
            refresh: RefreshConfig {
                removal_grace_cycles: c.refresh.removal_grace_cycles,
                collect_metrics: c.refresh.collect_metrics,
            },
            event_capacity: c.refresh.event_capacity,
            update_checks_enabled: c.update_checks.enabled,
            detector: DetectorConfig {
                cache_ttl: ChronoDuration::hours(c.update_checks.cache_ttl_hours as i64),
                max_checks: c.update_checks.rate_limit_checks,
                window: ChronoDuration::hours(c.update_checks.rate_limit_period_hours as i64),
            },
            orchestrator: OrchestratorConfig {
                default_timeout: Duration::from_secs(c.stack_update.default_timeout_secs),
                poll_interval: Duration::from_secs(c.stack_update.poll_interval_secs),
                redeploy_retry_backoff: Duration::from_secs(
                    c.stack_update.redeploy_retry_backoff_secs,
                ),
            },
        }
    }
}

pub struct StackPilot {
    endpoints: BTreeMap<EndpointId, Endpoint>,
    client: Arc<dyn RemoteClient>,
    coordinator: Arc<RefreshCoordinator>,
    detector: Arc<UpdateDetector>,
    orchestrator: Arc<StackUpdateOrchestrator>,
    update_checks_enabled: bool,
}

impl StackPilot {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        endpoints: Vec<Endpoint>,
        settings: ServiceSettings,
        repo: Option<Arc<CacheRepo>>,
    ) -> Self {
        let endpoints: BTreeMap<EndpointId, Endpoint> =
            endpoints.into_iter().map(|e| (e.id, e)).collect();
        let store = Arc::new(SnapshotStore::new(endpoints.keys().copied()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&client),
            store,
            settings.refresh,
            settings.event_capacity,
        ));
        let detector = Arc::new(UpdateDetector::new(
            Arc::clone(&client),
            settings.detector,
            repo,
        ));
        let orchestrator = Arc::new(StackUpdateOrchestrator::new(
            Arc::clone(&client),
            Arc::clone(&coordinator),
            settings.orchestrator,
        ));
        Self {
            endpoints,
            client,
            coordinator,
            detector,
            orchestrator,
            update_checks_enabled: settings.update_checks_enabled,
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn detector(&self) -> &Arc<UpdateDetector> {
        &self.detector
    }

    pub fn orchestrator(&self) -> &Arc<StackUpdateOrchestrator> {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.coordinator.subscribe()
    }

    fn known(&self, endpoint: EndpointId) -> Result<(), ServiceError> {
        if self.endpoints.contains_key(&endpoint) {
            Ok(())
        } else {
            Err(ServiceError::UnknownEndpoint(endpoint))
        }
    }

    /// Latest retained snapshot, degraded or not. Never calls the remote API.
    pub fn get_snapshot(&self, endpoint: EndpointId) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        self.coordinator
            .snapshot(endpoint)
            .ok_or(ServiceError::UnknownEndpoint(endpoint))
    }

    pub async fn force_refresh(&self, endpoint: EndpointId) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    /// Update check for a container of the current snapshot, by id or name.
    pub async fn request_update_check(
        &self,
        endpoint: EndpointId,
        container: &str,
    ) -> Result<UpdateCheck, ServiceError> {
        if !self.update_checks_enabled {
            return Err(ServiceError::UpdateChecksDisabled);
        }
        let snapshot = self.get_snapshot(endpoint)?;
        let record = snapshot
            .container_by_id(container)
            .filter(|c| c.is_present())
            .ok_or_else(|| ServiceError::UnknownContainer {
                endpoint,
                container: container.to_string(),
            })?;
        Ok(self
            .detector
            .check_update(endpoint, &record.image, record.created_at)
            .await)
    }

    /// Check every distinct image of the endpoint's present containers. Returns how many
    /// checks report an update.
    pub async fn check_all_images(&self, endpoint: EndpointId) -> Result<usize, ServiceError> {
        if !self.update_checks_enabled {
            return Ok(0);
        }
        let snapshot = self.get_snapshot(endpoint)?;
        let mut seen = HashSet::new();
        let mut available = 0;
        for record in snapshot.present_containers() {
            if !seen.insert(record.image.name_with_tag()) {
                continue;
            }
            let check = self
                .detector
                .check_update(endpoint, &record.image, record.created_at)
                .await;
            if check.available {
                available += 1;
            }
        }
        Ok(available)
    }

    pub async fn request_stack_update(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
        timeout: Option<Duration>,
    ) -> Result<StackUpdateResponse, ServiceError> {
        self.known(endpoint)?;
        Ok(self
            .orchestrator
            .request_stack_update(endpoint, stack_id, timeout)
            .await)
    }

    pub fn active_operation(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<Option<StackUpdateOperation>, ServiceError> {
        self.known(endpoint)?;
        Ok(self
            .orchestrator
            .active_operation(stack_id)
            .filter(|op| op.endpoint_id == endpoint))
    }

    pub fn last_stack_update(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<Option<StackUpdateResult>, ServiceError> {
        self.known(endpoint)?;
        Ok(self
            .orchestrator
            .last_result(stack_id)
            .filter(|r| r.endpoint_id == endpoint))
    }

    /// Id to act on: the snapshot's current id when `container` names a known container.
    fn resolve_container(&self, endpoint: EndpointId, container: &str) -> String {
        self.coordinator
            .snapshot(endpoint)
            .and_then(|s| s.container_by_id(container).map(|c| c.id.clone()))
            .unwrap_or_else(|| container.to_string())
    }

    pub async fn start_container(
        &self,
        endpoint: EndpointId,
        container: &str,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        let id = self.resolve_container(endpoint, container);
        info!(endpoint_id = endpoint, container_id = %id, "starting container");
        self.client.start_container(endpoint, &id).await?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    pub async fn stop_container(
        &self,
        endpoint: EndpointId,
        container: &str,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        let id = self.resolve_container(endpoint, container);
        info!(endpoint_id = endpoint, container_id = %id, "stopping container");
        self.client.stop_container(endpoint, &id).await?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    pub async fn restart_container(
        &self,
        endpoint: EndpointId,
        container: &str,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        let id = self.resolve_container(endpoint, container);
        info!(endpoint_id = endpoint, container_id = %id, "restarting container");
        self.client.restart_container(endpoint, &id).await?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    /// Pull the image a container of the current snapshot runs. The cached update check
    /// for that image is dropped so the next check sees the pulled build.
    pub async fn pull_image(
        &self,
        endpoint: EndpointId,
        container: &str,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        let snapshot = self.get_snapshot(endpoint)?;
        let image = snapshot
            .container_by_id(container)
            .filter(|c| c.is_present())
            .map(|c| c.image.clone())
            .ok_or_else(|| ServiceError::UnknownContainer {
                endpoint,
                container: container.to_string(),
            })?;
        info!(endpoint_id = endpoint, image = %image, "pulling image");
        self.client.pull_image(endpoint, &image).await?;
        self.detector.forget(endpoint, &image);
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    pub async fn start_stack(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        info!(endpoint_id = endpoint, stack_id, "starting stack");
        self.client.start_stack(endpoint, stack_id).await?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }

    pub async fn stop_stack(
        &self,
        endpoint: EndpointId,
        stack_id: StackId,
    ) -> Result<Arc<Snapshot>, ServiceError> {
        self.known(endpoint)?;
        info!(endpoint_id = endpoint, stack_id, "stopping stack");
        self.client.stop_stack(endpoint, stack_id).await?;
        Ok(self.coordinator.force_refresh(endpoint).await)
    }
}
