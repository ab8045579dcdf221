// Refresh coordinator: single-flight per endpoint refresh into the snapshot store.
// The coordinator is the store's only writer; readers get whole Arc<Snapshot>s.

mod merge;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailureKind, RemoteError};
use crate::models::{ContainerStatus, EndpointId, Snapshot, SnapshotEvent};
use crate::remote::{RemoteClient, RemoteContainer, RemoteStack};
use merge::Observed;

/// Latest snapshot per endpoint. Writes replace the whole snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: RwLock<HashMap<EndpointId, Arc<Snapshot>>>,
}

impl SnapshotStore {
    /// Store seeded with an empty snapshot for each endpoint.
    pub fn new(endpoints: impl IntoIterator<Item = EndpointId>) -> Self {
        let snapshots = endpoints
            .into_iter()
            .map(|id| (id, Arc::new(Snapshot::empty(id))))
            .collect();
        Self {
            snapshots: RwLock::new(snapshots),
        }
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<Arc<Snapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&endpoint)
            .cloned()
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.endpoint_id, Arc::clone(&snapshot));
        snapshot
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub removal_grace_cycles: u32,
    pub collect_metrics: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            removal_grace_cycles: 1,
            collect_metrics: true,
        }
    }
}

/// Counters for the periodic stats log.
#[derive(Debug, Default)]
pub struct RefreshStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    /// Refresh requests that attached to one already in flight.
    pub coalesced: AtomicU64,
    /// Scheduled refreshes skipped because the endpoint rejected the credentials.
    pub auth_paused: AtomicU64,
}

type InFlight = Shared<BoxFuture<'static, Arc<Snapshot>>>;

pub struct RefreshCoordinator {
    client: Arc<dyn RemoteClient>,
    store: Arc<SnapshotStore>,
    config: RefreshConfig,
    in_flight: Mutex<HashMap<EndpointId, InFlight>>,
    events: broadcast::Sender<SnapshotEvent>,
    stats: RefreshStats,
}

impl RefreshCoordinator {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        store: Arc<SnapshotStore>,
        config: RefreshConfig,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            client,
            store,
            config,
            in_flight: Mutex::new(HashMap::new()),
            events,
            stats: RefreshStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn snapshot(&self, endpoint: EndpointId) -> Option<Arc<Snapshot>> {
        self.store.get(endpoint)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> &RefreshStats {
        &self.stats
    }

    /// Refresh one endpoint. A call made while a refresh of the same endpoint is in flight
    /// attaches to it instead of issuing new remote calls.
    ///
    /// Never fails: on remote failure the previous snapshot is returned, marked degraded.
    pub async fn refresh(self: &Arc<Self>, endpoint: EndpointId) -> Arc<Snapshot> {
        let in_flight = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&endpoint) {
                Some(running) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint_id = endpoint, "attaching to in-flight refresh");
                    running.clone()
                }
                None => {
                    // Spawned so a dropped caller cannot cancel a refresh others attached to.
                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let snapshot = this.run(endpoint).await;
                        this.in_flight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&endpoint);
                        snapshot
                    });
                    let store = Arc::clone(&self.store);
                    let running = async move {
                        match task.await {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                error!(endpoint_id = endpoint, error = %e, "refresh task failed");
                                store
                                    .get(endpoint)
                                    .unwrap_or_else(|| Arc::new(Snapshot::empty(endpoint)))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(endpoint, running.clone());
                    running
                }
            }
        };
        in_flight.await
    }

    /// Out-of-cycle refresh; same single-flight rules as the scheduled one. Also the way to
    /// resume an endpoint whose scheduled refreshes stopped on an authentication failure.
    pub async fn force_refresh(self: &Arc<Self>, endpoint: EndpointId) -> Arc<Snapshot> {
        self.refresh(endpoint).await
    }

    /// Timer-driven refresh. Returns `None` without any remote call while the endpoint's last
    /// failure was rejected credentials; only `force_refresh` retries those.
    pub async fn scheduled_refresh(self: &Arc<Self>, endpoint: EndpointId) -> Option<Arc<Snapshot>> {
        if let Some(current) = self.store.get(endpoint)
            && current
                .degraded
                .as_ref()
                .is_some_and(|d| d.kind == FailureKind::Auth)
        {
            self.stats.auth_paused.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint_id = endpoint, "scheduled refresh skipped: credentials rejected");
            return None;
        }
        Some(self.refresh(endpoint).await)
    }

    async fn run(&self, endpoint: EndpointId) -> Arc<Snapshot> {
        let prev = self
            .store
            .get(endpoint)
            .unwrap_or_else(|| Arc::new(Snapshot::empty(endpoint)));
        let now = Utc::now();
        match self.collect(endpoint).await {
            Ok((observed, stacks)) => {
                let (next, changes) = merge::merge(
                    &prev,
                    observed,
                    &stacks,
                    now,
                    self.config.removal_grace_cycles,
                );
                let next = self.store.replace(next);
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                if prev.is_degraded() {
                    info!(endpoint_id = endpoint, "endpoint reachable again");
                }
                debug!(
                    endpoint_id = endpoint,
                    version = next.version,
                    containers = next.containers.len(),
                    stacks = next.stacks.len(),
                    added = changes.added.len(),
                    removed = changes.removed.len(),
                    changed = changes.changed.len(),
                    "refresh merged"
                );
                if !changes.is_empty() || prev.is_degraded() {
                    self.publish(SnapshotEvent::Refreshed {
                        endpoint_id: endpoint,
                        version: next.version,
                        added: changes.added,
                        removed: changes.removed,
                        changed: changes.changed,
                    });
                }
                next
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let next = self.store.replace(merge::degrade(&prev, &err, now));
                let message = merge::failure_message(endpoint, &err);
                match &err {
                    RemoteError::Auth(_) => {
                        error!(endpoint_id = endpoint, error = %err, operation = "refresh", "{message}");
                        warn!(endpoint_id = endpoint, "scheduled refreshes paused until a manual refresh succeeds");
                        self.publish(SnapshotEvent::AuthFailed {
                            endpoint_id: endpoint,
                            message,
                        });
                    }
                    RemoteError::NotFound(_) => {
                        error!(endpoint_id = endpoint, error = %err, operation = "refresh", "{message}");
                        self.publish(SnapshotEvent::Degraded {
                            endpoint_id: endpoint,
                            kind: err.kind(),
                            message,
                        });
                    }
                    _ => {
                        warn!(
                            endpoint_id = endpoint,
                            error = %err,
                            operation = "refresh",
                            "refresh failed; keeping previous state until the next scheduled refresh"
                        );
                        self.publish(SnapshotEvent::Degraded {
                            endpoint_id: endpoint,
                            kind: err.kind(),
                            message,
                        });
                    }
                }
                next
            }
        }
    }

    fn publish(&self, event: SnapshotEvent) {
        if self.events.send(event).is_err() {
            debug!(operation = "publish_event", "no event subscribers");
        }
    }

    /// Pull containers and stacks; inspect every container for labels and start time, then
    /// sample metrics of the running ones.
    #[instrument(skip(self), fields(operation = "collect"))]
    async fn collect(
        &self,
        endpoint: EndpointId,
    ) -> Result<(Vec<Observed>, Vec<RemoteStack>), RemoteError> {
        let (listed, stacks) = tokio::try_join!(
            self.client.list_containers(endpoint),
            self.client.list_stacks(endpoint)
        )?;

        let details = join_all(
            listed
                .iter()
                .map(|c| self.client.inspect_container(endpoint, &c.id)),
        )
        .await;

        let mut observed = Vec::with_capacity(listed.len());
        for (summary, detail) in listed.into_iter().zip(details) {
            match detail {
                Ok(d) => observed.push(Observed {
                    container: RemoteContainer {
                        id: d.id,
                        name: d.name,
                        image: if d.image.is_empty() { summary.image } else { d.image },
                        image_id: d.image_id.or(summary.image_id),
                        status: d.status,
                        labels: d.labels,
                        created_at: d.created_at.or(summary.created_at),
                    },
                    started_at: d.started_at,
                    metrics: None,
                }),
                Err(e @ RemoteError::Auth(_)) => return Err(e),
                // Removed between list and inspect.
                Err(RemoteError::NotFound(_)) => {}
                Err(e) => {
                    debug!(container = %summary.name, error = %e, "inspect failed, using list data");
                    observed.push(Observed {
                        container: summary,
                        started_at: None,
                        metrics: None,
                    });
                }
            }
        }

        if self.config.collect_metrics {
            let samples = join_all(
                observed
                    .iter()
                    .filter(|o| o.container.status == ContainerStatus::Running)
                    .map(|o| async move {
                        let id = o.container.id.clone();
                        let sample = self.client.container_stats(endpoint, &id).await;
                        (id, sample)
                    }),
            )
            .await;
            let mut by_id: HashMap<String, _> = HashMap::with_capacity(samples.len());
            for (id, sample) in samples {
                match sample {
                    Ok(m) => {
                        by_id.insert(id, m);
                    }
                    Err(e) => debug!(container_id = %id, error = %e, "stats unavailable"),
                }
            }
            for o in &mut observed {
                o.metrics = by_id.remove(&o.container.id);
            }
        }

        Ok((observed, stacks))
    }
}
