//! Status aggregation and phase-change sinks
//!
//! Phase handlers do not write phases directly. They feed what they observed
//! (task results, health checks, delete requests) into a [`StatusAggregator`],
//! which folds the observations into one phase plus human-readable
//! conditions. A proposed phase that is not an edge of the transition table
//! is ignored, so the phase can only move forward or along the explicit
//! delete and retry edges.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::controller::transitions::{next_phase, Trigger};
use crate::crd::{
    Cluster, ClusterPhase, ClusterStatus, Condition, ConditionStatus, ResourceHandle, TaskKind,
};
use crate::Error;

/// Condition type reporting provisioning progress
pub const CONDITION_INFRASTRUCTURE_READY: &str = "InfrastructureReady";
/// Condition type reporting transient provisioner failures
pub const CONDITION_PROVISION_RETRYING: &str = "ProvisionRetrying";
/// Condition type reporting the control-plane health check
pub const CONDITION_CONTROL_PLANE_HEALTHY: &str = "ControlPlaneHealthy";
/// Condition type reporting teardown progress
pub const CONDITION_RESOURCES_RELEASED: &str = "ResourcesReleased";
/// Condition type reporting rejected delete requests
pub const CONDITION_DELETION_BLOCKED: &str = "DeletionBlocked";
/// Condition type summarizing whether the cluster is usable
pub const CONDITION_READY: &str = "Ready";

/// Something a phase handler observed
#[derive(Clone, Debug)]
pub enum Observation {
    /// A cluster ID was assigned and provisioning dispatched
    ProvisioningDispatched {
        /// The assigned ID
        cluster_id: String,
    },
    /// The next task is about to run
    WaitingForTask(TaskKind),
    /// A task attempt failed with a retryable error
    TaskRetrying {
        /// Task being retried
        task: TaskKind,
        /// Attempt that failed
        attempt: u32,
        /// Error of that attempt
        error: String,
    },
    /// A task completed
    TaskCompleted {
        /// Completed task
        task: TaskKind,
        /// Resource it produced
        handle: ResourceHandle,
        /// Attempts it took
        attempts: u32,
    },
    /// A task failed for good
    TaskFailed {
        /// Failed task
        task: TaskKind,
        /// Final error
        error: String,
    },
    /// Every planned task has a checkpoint
    AllTasksReady,
    /// Result of the control-plane health check
    HealthCheck {
        /// Whether the control plane answered
        healthy: bool,
        /// Detail for an unhealthy result
        detail: Option<String>,
    },
    /// Deletion requested with delete protection off
    DeleteRequested,
    /// Deletion requested while delete protection is on
    DeleteBlocked,
    /// Operator asked for a failed phase to be retried
    OperatorRetry,
    /// A checkpointed resource was torn down
    ResourceTornDown(TaskKind),
    /// Every checkpointed resource is gone
    TeardownComplete,
    /// Teardown of a resource failed for good
    TeardownFailed {
        /// Task whose resource could not be torn down
        task: TaskKind,
        /// Final error
        error: String,
    },
}

fn waiting_message(task: TaskKind) -> &'static str {
    match task {
        TaskKind::ReserveContainerNetwork => "waiting for container network",
        TaskKind::CreateMasters => "waiting for master nodes",
        TaskKind::AttachApiserverLb => "waiting for apiserver load balancer",
    }
}

/// Folds observations into a status proposal for one reconcile
#[derive(Debug)]
pub struct StatusAggregator {
    cluster: String,
    status: ClusterStatus,
}

impl StatusAggregator {
    /// Start from the cluster's current status
    pub fn new(cluster: &Cluster) -> Self {
        let status = cluster.status.clone().unwrap_or_default();
        Self {
            cluster: cluster.key(),
            status,
        }
    }

    /// Phase after the observations so far
    pub fn phase(&self) -> ClusterPhase {
        self.status.phase
    }

    /// Status proposal so far
    pub fn status(&self) -> &ClusterStatus {
        &self.status
    }

    /// Consume the aggregator, returning the proposed status
    pub fn into_status(self) -> ClusterStatus {
        self.status
    }

    /// Fold one observation into the proposal
    pub fn observe(&mut self, observation: Observation) -> &mut Self {
        match observation {
            Observation::ProvisioningDispatched { cluster_id } => {
                if self.propose(Trigger::ProvisioningDispatched) {
                    self.status.cluster_id.get_or_insert(cluster_id);
                    self.set(
                        CONDITION_INFRASTRUCTURE_READY,
                        ConditionStatus::False,
                        "ProvisioningDispatched",
                        "provisioning dispatched",
                    );
                }
            }
            Observation::WaitingForTask(task) => {
                self.set(
                    CONDITION_INFRASTRUCTURE_READY,
                    ConditionStatus::False,
                    "WaitingForTask",
                    waiting_message(task),
                );
            }
            Observation::TaskRetrying {
                task,
                attempt,
                error,
            } => {
                self.set(
                    CONDITION_PROVISION_RETRYING,
                    ConditionStatus::True,
                    "TransientError",
                    format!("retrying {task} (attempt {}): {error}", attempt + 1),
                );
            }
            Observation::TaskCompleted {
                task,
                handle,
                attempts,
            } => {
                self.status.record_checkpoint(task, handle);
                if attempts > 1 {
                    self.set(
                        CONDITION_PROVISION_RETRYING,
                        ConditionStatus::False,
                        "Recovered",
                        format!("{task} completed after {attempts} attempts"),
                    );
                }
            }
            Observation::TaskFailed { task, error } => {
                if self.propose(Trigger::ProvisioningFailed) {
                    let message = format!("{task} failed: {error}");
                    self.set(
                        CONDITION_INFRASTRUCTURE_READY,
                        ConditionStatus::False,
                        "TaskFailed",
                        message.clone(),
                    );
                    self.set(CONDITION_READY, ConditionStatus::False, "CreateFailed", message);
                }
            }
            Observation::AllTasksReady => {
                if self.propose(Trigger::AllResourcesReady) {
                    self.set(
                        CONDITION_INFRASTRUCTURE_READY,
                        ConditionStatus::True,
                        "AllTasksComplete",
                        "all infrastructure resources are ready",
                    );
                }
            }
            Observation::HealthCheck { healthy: true, .. } => {
                if self.propose(Trigger::HealthCheckPassed) {
                    self.set(
                        CONDITION_CONTROL_PLANE_HEALTHY,
                        ConditionStatus::True,
                        "HealthCheckPassed",
                        "control plane is healthy",
                    );
                    self.set(CONDITION_READY, ConditionStatus::True, "Running", "cluster is running");
                }
            }
            Observation::HealthCheck {
                healthy: false,
                detail,
            } => {
                let message = detail.unwrap_or_else(|| "waiting for control plane".to_string());
                self.set(
                    CONDITION_CONTROL_PLANE_HEALTHY,
                    ConditionStatus::False,
                    "HealthCheckFailed",
                    message,
                );
            }
            Observation::DeleteRequested => {
                if self.propose(Trigger::DeleteRequested) {
                    self.status.conditions.retain(|c| c.type_ != CONDITION_DELETION_BLOCKED);
                    self.set(
                        CONDITION_RESOURCES_RELEASED,
                        ConditionStatus::False,
                        "DeletionStarted",
                        "tearing down cluster resources",
                    );
                    self.set(CONDITION_READY, ConditionStatus::False, "Deleting", "cluster is being deleted");
                }
            }
            Observation::DeleteBlocked => {
                self.set(
                    CONDITION_DELETION_BLOCKED,
                    ConditionStatus::True,
                    "ForbidDelete",
                    "delete protection is enabled; set forbidDelete=false to delete",
                );
            }
            Observation::OperatorRetry => {
                if self.propose(Trigger::OperatorRetry) {
                    self.status.conditions.retain(|c| {
                        c.type_ != CONDITION_PROVISION_RETRYING && c.type_ != CONDITION_READY
                    });
                    let (condition, message) = match self.status.phase {
                        ClusterPhase::Provisioning => {
                            (CONDITION_INFRASTRUCTURE_READY, "provisioning retried by operator")
                        }
                        _ => (CONDITION_RESOURCES_RELEASED, "teardown retried by operator"),
                    };
                    self.set(condition, ConditionStatus::False, "OperatorRetry", message);
                }
            }
            Observation::ResourceTornDown(task) => {
                self.status.mark_torn_down(task);
                self.set(
                    CONDITION_RESOURCES_RELEASED,
                    ConditionStatus::False,
                    "TearingDown",
                    format!("{task} torn down"),
                );
            }
            Observation::TeardownComplete => {
                if self.propose(Trigger::AllResourcesTornDown) {
                    self.set(
                        CONDITION_RESOURCES_RELEASED,
                        ConditionStatus::True,
                        "AllResourcesReleased",
                        "every cluster resource has been torn down",
                    );
                }
            }
            Observation::TeardownFailed { task, error } => {
                if self.propose(Trigger::TeardownFailed) {
                    let message = format!("teardown of {task} failed: {error}");
                    self.set(
                        CONDITION_RESOURCES_RELEASED,
                        ConditionStatus::False,
                        "TeardownFailed",
                        message.clone(),
                    );
                    self.set(CONDITION_READY, ConditionStatus::False, "DeleteFailed", message);
                }
            }
        }
        self
    }

    fn propose(&mut self, trigger: Trigger) -> bool {
        match next_phase(self.status.phase, trigger) {
            Some(next) => {
                debug!(
                    cluster = %self.cluster,
                    from = %self.status.phase,
                    to = %next,
                    ?trigger,
                    "phase proposal accepted"
                );
                self.status.phase = next;
                true
            }
            None => {
                debug!(
                    cluster = %self.cluster,
                    phase = %self.status.phase,
                    ?trigger,
                    "phase proposal ignored"
                );
                false
            }
        }
    }

    fn set(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let condition = Condition::new(type_, status, reason, message);
        // The record's message mirrors the most recent progress report.
        self.status.message = Some(condition.message.clone());
        self.status.set_condition(condition);
    }
}

// =============================================================================
// Status sinks
// =============================================================================

/// A persisted status change, as published to sinks
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChange {
    /// Record key
    pub cluster: String,
    /// Phase before the write
    pub old_phase: ClusterPhase,
    /// Phase after the write
    pub new_phase: ClusterPhase,
    /// Conditions after the write
    pub conditions: Vec<Condition>,
}

/// Receives every status write for observability
///
/// Sinks are fire-and-forget: they never fail and never block the reconciler
/// for long.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// A status write changed the phase or the conditions
    async fn on_phase_change(
        &self,
        cluster: &str,
        old_phase: ClusterPhase,
        new_phase: ClusterPhase,
        conditions: Vec<Condition>,
    );

    /// A reconcile ended in an error the operator should see
    async fn on_reconcile_error(&self, cluster: &str, error: &Error);
}

/// Sink that logs every change
#[derive(Clone, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn on_phase_change(
        &self,
        cluster: &str,
        old_phase: ClusterPhase,
        new_phase: ClusterPhase,
        conditions: Vec<Condition>,
    ) {
        let summary: Vec<String> = conditions
            .iter()
            .map(|c| format!("{}={} ({})", c.type_, c.status, c.message))
            .collect();
        info!(
            cluster = %cluster,
            from = %old_phase,
            to = %new_phase,
            conditions = %summary.join(", "),
            "cluster status changed"
        );
    }

    async fn on_reconcile_error(&self, cluster: &str, error: &Error) {
        error!(cluster = %cluster, kind = error.kind(), error = %error, "reconcile failed");
    }
}

/// Sink that publishes changes on a broadcast channel
///
/// Lagging or absent subscribers lose messages; the reconciler never waits.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    changes: broadcast::Sender<PhaseChange>,
    errors: broadcast::Sender<(String, String)>,
}

impl ChannelSink {
    /// Create a sink buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);
        Self { changes, errors }
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChange> {
        self.changes.subscribe()
    }

    /// Subscribe to reconcile errors, as `(cluster, message)` pairs
    pub fn subscribe_errors(&self) -> broadcast::Receiver<(String, String)> {
        self.errors.subscribe()
    }
}

#[async_trait]
impl StatusSink for ChannelSink {
    async fn on_phase_change(
        &self,
        cluster: &str,
        old_phase: ClusterPhase,
        new_phase: ClusterPhase,
        conditions: Vec<Condition>,
    ) {
        // No subscribers is not an error.
        let _ = self.changes.send(PhaseChange {
            cluster: cluster.to_string(),
            old_phase,
            new_phase,
            conditions,
        });
    }

    async fn on_reconcile_error(&self, cluster: &str, error: &Error) {
        let _ = self.errors.send((cluster.to_string(), error.to_string()));
    }
}
