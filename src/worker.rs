// Background refresh worker: one scheduled refresh loop per endpoint, followed by update
// checks of the refreshed images. Also prunes persisted budget rows and logs app stats.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio::time::{Duration, interval};

use crate::models::EndpointId;
use crate::service::StackPilot;

/// Service, counters, and shutdown for the worker.
pub struct WorkerDeps {
    pub pilot: Arc<StackPilot>,
    pub ws_event_connections: Arc<AtomicUsize>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Worker timing config (real seconds).
pub struct WorkerConfig {
    pub refresh_interval_secs: u64,
    /// Run update checks for each distinct image after a successful refresh.
    pub check_on_refresh: bool,
    pub stats_log_interval_secs: u64,
    pub prune_interval_secs: u64,
}

fn spawn_endpoint_loop(
    pilot: Arc<StackPilot>,
    endpoint: EndpointId,
    refresh_interval: Duration,
    check_on_refresh: bool,
    mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(refresh_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Some(snapshot) = pilot.coordinator().scheduled_refresh(endpoint).await else {
                        continue;
                    };
                    if snapshot.is_degraded() || !check_on_refresh {
                        continue;
                    }
                    match pilot.check_all_images(endpoint).await {
                        Ok(available) => tracing::debug!(
                            endpoint_id = endpoint,
                            updates_available = available,
                            operation = "check_all_images",
                            "update checks done"
                        ),
                        Err(e) => tracing::warn!(
                            endpoint_id = endpoint,
                            error = %e,
                            operation = "check_all_images",
                            "update checks failed"
                        ),
                    }
                }
                _ = stop_rx.changed() => {
                    tracing::debug!(endpoint_id = endpoint, "refresh loop shutting down");
                    break;
                }
            }
        }
    })
}

pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        pilot,
        ws_event_connections,
        mut shutdown_rx,
    } = deps;
    let WorkerConfig {
        refresh_interval_secs,
        check_on_refresh,
        stats_log_interval_secs,
        prune_interval_secs,
    } = config;

    let refresh_interval = Duration::from_secs(refresh_interval_secs);
    let stats_log_interval = Duration::from_secs(stats_log_interval_secs);
    let prune_interval = Duration::from_secs(prune_interval_secs);

    tokio::spawn(async move {
        let (stop_tx, stop_rx) = watch::channel(false);
        let loops: Vec<_> = pilot
            .endpoints()
            .map(|e| {
                spawn_endpoint_loop(
                    Arc::clone(&pilot),
                    e.id,
                    refresh_interval,
                    check_on_refresh,
                    stop_rx.clone(),
                )
            })
            .collect();

        let mut stats_log_tick = interval(stats_log_interval);
        stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prune_tick = interval(prune_interval);
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut budget_rows_pruned_total: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("Worker shutting down");
                    break;
                }
                _ = stats_log_tick.tick() => {
                    let refresh = pilot.coordinator().stats();
                    let detector = pilot.detector().stats();
                    tracing::info!(
                        endpoints = loops.len(),
                        refreshes_completed = refresh.completed.load(Ordering::Relaxed),
                        refreshes_failed = refresh.failed.load(Ordering::Relaxed),
                        refreshes_coalesced = refresh.coalesced.load(Ordering::Relaxed),
                        refreshes_paused_on_auth = refresh.auth_paused.load(Ordering::Relaxed),
                        registry_calls = detector.registry_calls.load(Ordering::Relaxed),
                        budget_fallbacks = detector.budget_fallbacks.load(Ordering::Relaxed),
                        active_stack_updates = pilot.orchestrator().active_count(),
                        ws_event_clients = ws_event_connections.load(Ordering::Relaxed),
                        budget_rows_pruned_total,
                        "app stats"
                    );
                }
                _ = prune_tick.tick() => {
                    match pilot.detector().prune_persisted(Utc::now()).await {
                        Ok(n) => {
                            budget_rows_pruned_total += n;
                            tracing::debug!(operation = "prune_budget_usage", rows = n, "Budget rows pruned");
                        }
                        Err(e) => tracing::warn!(
                            error = %e,
                            operation = "prune_budget_usage",
                            "Failed to prune budget rows"
                        ),
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        for handle in loops {
            let _ = handle.await;
        }
    })
}
