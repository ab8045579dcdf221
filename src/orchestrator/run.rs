// One stack update run, step by step. Step failures are recorded in the reports; only
// FetchingDefinition and Redeploying end the run early.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::StackUpdateOrchestrator;
use crate::error::RemoteError;
use crate::models::{
    ContainerReport, ContainerStatus, EndpointId, HealthStatus, RedeployReport, StackId,
    StackUpdateOperation, StackUpdateOutcome, StackUpdateResult, StackUpdateState, StepStatus,
};
use crate::remote::{RemoteContainer, StackDefinition};

pub(super) struct Run<'a> {
    orchestrator: &'a StackUpdateOrchestrator,
    op: Arc<Mutex<StackUpdateOperation>>,
    endpoint: EndpointId,
    stack_id: StackId,
    timeout: Duration,
    stack_name: Option<String>,
    containers: Vec<ContainerReport>,
    redeploy: RedeployReport,
}

fn by_service(a: &RemoteContainer, b: &RemoteContainer) -> std::cmp::Ordering {
    let service = |c: &RemoteContainer| c.membership().and_then(|m| m.service);
    service(a)
        .cmp(&service(b))
        .then_with(|| a.name.cmp(&b.name))
}

fn members_of(containers: Vec<RemoteContainer>, stack_name: &str) -> Vec<RemoteContainer> {
    let mut members: Vec<RemoteContainer> = containers
        .into_iter()
        .filter(|c| c.is_member_of(stack_name))
        .collect();
    members.sort_by(by_service);
    members
}

impl<'a> Run<'a> {
    pub(super) fn new(
        orchestrator: &'a StackUpdateOrchestrator,
        op: Arc<Mutex<StackUpdateOperation>>,
        endpoint: EndpointId,
        stack_id: StackId,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            op,
            endpoint,
            stack_id,
            timeout,
            stack_name: None,
            containers: Vec::new(),
            redeploy: RedeployReport {
                attempts: 0,
                status: StepStatus::NotAttempted,
            },
        }
    }

    /// Publish progress to the shared operation record.
    fn publish(&self, state: Option<StackUpdateState>) {
        let mut op = self.op.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state {
            op.state = state;
        }
        op.stack_name.clone_from(&self.stack_name);
        op.containers.clone_from(&self.containers);
        op.redeploy.clone_from(&self.redeploy);
    }

    fn enter(&self, state: StackUpdateState) {
        debug!(endpoint_id = self.endpoint, stack_id = self.stack_id, state = ?state, "stack update step");
        self.publish(Some(state));
    }

    fn finish(
        self,
        outcome: StackUpdateOutcome,
        failed_at: Option<StackUpdateState>,
        error: Option<String>,
    ) -> StackUpdateResult {
        self.publish(Some(outcome.into()));
        let (started_at, destructive_actions_taken) = {
            let op = self.op.lock().unwrap_or_else(|e| e.into_inner());
            (op.started_at, op.destructive_actions_taken())
        };
        StackUpdateResult {
            endpoint_id: self.endpoint,
            stack_id: self.stack_id,
            stack_name: self.stack_name,
            outcome,
            failed_at,
            error,
            destructive_actions_taken,
            redeploy: self.redeploy,
            containers: self.containers,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn fail(self, at: StackUpdateState, error: String) -> StackUpdateResult {
        warn!(
            endpoint_id = self.endpoint,
            stack_id = self.stack_id,
            state = ?at,
            error = %error,
            "stack update failed"
        );
        self.finish(StackUpdateOutcome::Failed, Some(at), Some(error))
    }

    pub(super) async fn execute(mut self) -> StackUpdateResult {
        let client = Arc::clone(&self.orchestrator.client);

        self.enter(StackUpdateState::FetchingDefinition);
        let definition = match client.get_stack_definition(self.endpoint, self.stack_id).await {
            Ok(d) => d,
            Err(e) => {
                return self.fail(
                    StackUpdateState::FetchingDefinition,
                    format!("could not fetch stack definition: {e}"),
                );
            }
        };
        self.stack_name = Some(definition.name.clone());
        if !definition.is_deployable() {
            return self.fail(
                StackUpdateState::FetchingDefinition,
                format!(
                    "stack definition of {} has no usable compose text",
                    definition.name
                ),
            );
        }
        let members = match client.list_containers(self.endpoint).await {
            Ok(all) => members_of(all, &definition.name),
            Err(e) => {
                return self.fail(
                    StackUpdateState::FetchingDefinition,
                    format!("could not list stack containers: {e}"),
                );
            }
        };
        self.containers = members
            .iter()
            .map(|c| {
                ContainerReport::new(
                    c.name.clone(),
                    c.membership().and_then(|m| m.service),
                    Some(c.id.clone()),
                )
            })
            .collect();

        self.enter(StackUpdateState::Stopping);
        for (i, member) in members.iter().enumerate() {
            self.containers[i].stop = match client.stop_container(self.endpoint, &member.id).await {
                Ok(()) => StepStatus::Ok,
                Err(e) => {
                    warn!(container = %member.name, error = %e, operation = "stop_container", "stop failed, continuing");
                    StepStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            self.publish(None);
        }

        self.enter(StackUpdateState::Deleting);
        for (i, member) in members.iter().enumerate() {
            self.containers[i].delete =
                match client.delete_container(self.endpoint, &member.id).await {
                    Ok(()) => StepStatus::Ok,
                    Err(e) => {
                        warn!(container = %member.name, error = %e, operation = "delete_container", "delete failed, continuing");
                        StepStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
            self.publish(None);
        }

        self.enter(StackUpdateState::Redeploying);
        if let Err(e) = self.redeploy_with_retry(&definition).await {
            return self.fail(
                StackUpdateState::Redeploying,
                format!("redeploy failed, stack may be partially torn down: {e}"),
            );
        }

        self.enter(StackUpdateState::AwaitingHealthy);
        self.await_healthy(&definition.name).await
    }

    /// Redeploy with forced pull. A transient failure is retried once after the backoff.
    async fn redeploy_with_retry(
        &mut self,
        definition: &StackDefinition,
    ) -> Result<(), RemoteError> {
        let client = &self.orchestrator.client;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.redeploy.attempts = attempts;
            self.publish(None);
            match client.redeploy_stack(self.endpoint, definition, true).await {
                Ok(()) => {
                    self.redeploy.status = StepStatus::Ok;
                    return Ok(());
                }
                Err(e) if attempts == 1 && e.is_transient() => {
                    let backoff = self.orchestrator.config.redeploy_retry_backoff;
                    warn!(
                        stack_id = self.stack_id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "redeploy failed, retrying once"
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    self.redeploy.status = StepStatus::Failed {
                        reason: e.to_string(),
                    };
                    return Err(e);
                }
            }
        }
    }

    /// Apply one poll: match members to reports by name, adding reports for new members.
    fn observe(&mut self, members: &[RemoteContainer]) {
        for report in &mut self.containers {
            report.current_id = None;
            report.final_status = ContainerStatus::Unknown;
            report.health = HealthStatus::Pending;
        }
        for member in members {
            let idx = match self.containers.iter().position(|r| r.name == member.name) {
                Some(i) => i,
                None => {
                    self.containers.push(ContainerReport::new(
                        member.name.clone(),
                        member.membership().and_then(|m| m.service),
                        None,
                    ));
                    self.containers.len() - 1
                }
            };
            let report = &mut self.containers[idx];
            report.current_id = Some(member.id.clone());
            report.final_status = member.status;
            report.health = if member.status == ContainerStatus::Running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Pending
            };
        }
    }

    fn all_healthy(&self) -> bool {
        !self.containers.is_empty()
            && self
                .containers
                .iter()
                .all(|c| c.health == HealthStatus::Healthy)
    }

    async fn await_healthy(mut self, stack_name: &str) -> StackUpdateResult {
        let client = Arc::clone(&self.orchestrator.client);
        let poll_interval = self.orchestrator.config.poll_interval;
        let deadline = Instant::now() + self.timeout;

        loop {
            match client.list_containers(self.endpoint).await {
                Ok(all) => {
                    let members = members_of(all, stack_name);
                    self.observe(&members);
                    self.publish(None);
                    if self.all_healthy() {
                        info!(
                            stack_id = self.stack_id,
                            containers = self.containers.len(),
                            "all stack containers running"
                        );
                        return self.finish(StackUpdateOutcome::Succeeded, None, None);
                    }
                }
                Err(e @ (RemoteError::NotFound(_) | RemoteError::Auth(_))) => {
                    return self.fail(
                        StackUpdateState::AwaitingHealthy,
                        format!("stack containers unavailable: {e}"),
                    );
                }
                Err(e) => {
                    debug!(stack_id = self.stack_id, error = %e, "health poll failed, polling again");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(poll_interval.min(deadline - now)).await;
        }

        for report in &mut self.containers {
            if report.health != HealthStatus::Healthy {
                report.health = if report.current_id.is_some() {
                    HealthStatus::Timeout
                } else {
                    HealthStatus::Missing
                };
            }
        }
        let total = self.containers.len();
        let healthy = self
            .containers
            .iter()
            .filter(|c| c.health == HealthStatus::Healthy)
            .count();
        let message = format!(
            "{healthy} of {total} containers running after {}s",
            self.timeout.as_secs()
        );
        if healthy == 0 {
            let reason = if self.containers.iter().all(|c| c.current_id.is_none()) {
                format!("stack containers missing after redeploy: {message}")
            } else {
                message
            };
            self.fail(StackUpdateState::AwaitingHealthy, reason)
        } else {
            warn!(stack_id = self.stack_id, healthy, total, "stack update timed out with containers not running");
            self.finish(
                StackUpdateOutcome::PartiallyFailed,
                Some(StackUpdateState::AwaitingHealthy),
                Some(message),
            )
        }
    }
}
