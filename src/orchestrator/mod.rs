// Stack force-update orchestrator: one operation per stack at a time, run as its own task.

mod run;

use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::models::{
    EndpointId, RedeployReport, StackId, StackUpdateOperation, StackUpdateOutcome,
    StackUpdateResponse, StackUpdateResult, StackUpdateState, StepStatus,
};
use crate::remote::RemoteClient;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// AwaitingHealthy timeout when the request names none.
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    /// Wait before the single redeploy retry.
    pub redeploy_retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(2),
            redeploy_retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Upper bound of the AwaitingHealthy timeout; longer requests are clamped to it.
pub const MAX_STACK_UPDATE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

type SharedOperation = Arc<Mutex<StackUpdateOperation>>;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Result of a run that ended without reaching a terminal state, built from the progress it
/// last published so steps already taken are still reported.
fn aborted_result(op: &Mutex<StackUpdateOperation>, error: String) -> StackUpdateResult {
    let op = op.lock().unwrap_or_else(|e| e.into_inner()).clone();
    StackUpdateResult {
        endpoint_id: op.endpoint_id,
        stack_id: op.stack_id,
        destructive_actions_taken: op.destructive_actions_taken(),
        failed_at: (!op.state.is_terminal()).then_some(op.state),
        stack_name: op.stack_name,
        outcome: StackUpdateOutcome::Failed,
        error: Some(error),
        redeploy: op.redeploy,
        containers: op.containers,
        started_at: op.started_at,
        finished_at: Utc::now(),
    }
}

pub struct StackUpdateOrchestrator {
    client: Arc<dyn RemoteClient>,
    coordinator: Arc<RefreshCoordinator>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<StackId, SharedOperation>>,
    last_results: Mutex<HashMap<StackId, StackUpdateResult>>,
}

/// Releases the stack's slot when the run ends, however it ends.
struct ActiveSlot {
    orchestrator: Arc<StackUpdateOrchestrator>,
    stack_id: StackId,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.orchestrator
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.stack_id);
    }
}

impl StackUpdateOrchestrator {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        coordinator: Arc<RefreshCoordinator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            coordinator,
            config,
            active: Mutex::new(HashMap::new()),
            last_results: Mutex::new(HashMap::new()),
        }
    }

    /// Progress of the stack's running operation, if any.
    pub fn active_operation(&self, stack_id: StackId) -> Option<StackUpdateOperation> {
        let op = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stack_id)
            .cloned()?;
        let snapshot = op.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Some(snapshot)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Result of the stack's most recent finished operation.
    pub fn last_result(&self, stack_id: StackId) -> Option<StackUpdateResult> {
        self.last_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stack_id)
            .cloned()
    }

    /// Force-update a stack: fetch definition, stop and delete members, redeploy with a fresh
    /// pull, then wait for the members to run.
    ///
    /// Returns `Busy` at once, without remote calls, when the stack already has an active
    /// operation. The run continues to a terminal state even if the caller goes away.
    pub async fn request_stack_update(
        self: &Arc<Self>,
        endpoint: EndpointId,
        stack_id: StackId,
        timeout: Option<Duration>,
    ) -> StackUpdateResponse {
        let requested = timeout.unwrap_or(self.config.default_timeout);
        let timeout = requested.min(MAX_STACK_UPDATE_TIMEOUT);
        if timeout < requested {
            warn!(
                endpoint_id = endpoint,
                stack_id,
                requested_secs = requested.as_secs(),
                timeout_secs = timeout.as_secs(),
                "stack update timeout clamped"
            );
        }
        let op = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(running) = active.get(&stack_id) {
                let current = running.lock().unwrap_or_else(|e| e.into_inner()).clone();
                info!(
                    endpoint_id = endpoint,
                    stack_id,
                    state = ?current.state,
                    "stack update rejected: operation already active"
                );
                return StackUpdateResponse::Busy(current);
            }
            let op = Arc::new(Mutex::new(StackUpdateOperation {
                endpoint_id: endpoint,
                stack_id,
                stack_name: None,
                state: StackUpdateState::Requested,
                started_at: Utc::now(),
                timeout_secs: timeout.as_secs(),
                containers: Vec::new(),
                redeploy: RedeployReport {
                    attempts: 0,
                    status: StepStatus::NotAttempted,
                },
            }));
            active.insert(stack_id, Arc::clone(&op));
            op
        };

        let shared = Arc::clone(&op);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let slot = ActiveSlot {
                orchestrator: Arc::clone(&this),
                stack_id,
            };
            info!(endpoint_id = endpoint, stack_id, timeout_secs = timeout.as_secs(), "stack update started");
            let run = run::Run::new(&this, Arc::clone(&op), endpoint, stack_id, timeout);
            let result = match AssertUnwindSafe(run.execute()).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(endpoint_id = endpoint, stack_id, error = %reason, "stack update run panicked");
                    aborted_result(&op, format!("operation aborted: {reason}"))
                }
            };
            info!(
                endpoint_id = endpoint,
                stack_id,
                outcome = ?result.outcome,
                failed_at = ?result.failed_at,
                "stack update finished"
            );
            this.last_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(stack_id, result.clone());
            drop(slot);
            this.coordinator.force_refresh(endpoint).await;
            result
        });

        match task.await {
            Ok(result) => StackUpdateResponse::Finished(result),
            Err(e) => {
                error!(endpoint_id = endpoint, stack_id, error = %e, "stack update task failed");
                let result = aborted_result(&shared, format!("operation aborted: {e}"));
                self.last_results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(stack_id, result.clone());
                StackUpdateResponse::Finished(result)
            }
        }
    }
}
