//! Phase transition table
//!
//! The only place that decides which phase follows which. Both the status
//! aggregator and the reconciler consult it, so a proposal that is not an
//! edge here can never be written.

use crate::crd::ClusterPhase;

/// Event that may move a cluster to another phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Cluster ID assigned and provisioning dispatched
    ProvisioningDispatched,
    /// Every provisioning task completed
    AllResourcesReady,
    /// A task failed fatally or exhausted its retry budget
    ProvisioningFailed,
    /// The control plane answered its health check
    HealthCheckPassed,
    /// Deletion was requested and delete protection is off
    DeleteRequested,
    /// Every checkpointed resource has been torn down
    AllResourcesTornDown,
    /// Teardown failed fatally or exhausted its retry budget
    TeardownFailed,
    /// Operator asked for a failed phase to be retried
    OperatorRetry,
}

impl Trigger {
    /// Every trigger
    pub const ALL: [Trigger; 8] = [
        Self::ProvisioningDispatched,
        Self::AllResourcesReady,
        Self::ProvisioningFailed,
        Self::HealthCheckPassed,
        Self::DeleteRequested,
        Self::AllResourcesTornDown,
        Self::TeardownFailed,
        Self::OperatorRetry,
    ];
}

/// Phase reached from `from` on `trigger`, or `None` if the trigger does
/// not apply in that phase
pub fn next_phase(from: ClusterPhase, trigger: Trigger) -> Option<ClusterPhase> {
    use ClusterPhase as P;
    use Trigger as T;

    match (from, trigger) {
        (P::Pending, T::ProvisioningDispatched) => Some(P::Provisioning),
        (P::Pending, T::DeleteRequested) => Some(P::Deleting),
        (P::Pending, _) => None,

        (P::Provisioning, T::AllResourcesReady) => Some(P::Provisioned),
        (P::Provisioning, T::ProvisioningFailed) => Some(P::CreateFailed),
        (P::Provisioning, _) => None,

        (P::Provisioned, T::HealthCheckPassed) => Some(P::Running),
        (P::Provisioned, T::DeleteRequested) => Some(P::Deleting),
        (P::Provisioned, _) => None,

        (P::Running, T::DeleteRequested) => Some(P::Deleting),
        (P::Running, _) => None,

        (P::CreateFailed, T::OperatorRetry) => Some(P::Provisioning),
        (P::CreateFailed, T::DeleteRequested) => Some(P::Deleting),
        (P::CreateFailed, _) => None,

        (P::Deleting, T::AllResourcesTornDown) => Some(P::Deleted),
        (P::Deleting, T::TeardownFailed) => Some(P::DeleteFailed),
        (P::Deleting, _) => None,

        (P::Deleted, _) => None,

        (P::DeleteFailed, T::OperatorRetry | T::DeleteRequested) => Some(P::Deleting),
        (P::DeleteFailed, _) => None,
    }
}

/// Whether `from -> to` is an edge of the table
pub fn is_allowed(from: ClusterPhase, to: ClusterPhase) -> bool {
    Trigger::ALL
        .into_iter()
        .any(|trigger| next_phase(from, trigger) == Some(to))
}
