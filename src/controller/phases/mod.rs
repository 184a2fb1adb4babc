//! Per-phase reconcile handlers
//!
//! Each handler decides the next step for a cluster in one phase, feeds what
//! it observed into a [`StatusAggregator`](crate::status::StatusAggregator)
//! and persists the proposal through [`update_status`].

pub(super) mod deleted;
pub(super) mod deleting;
pub(super) mod failed;
pub(super) mod pending;
pub(super) mod provisioned;
pub(super) mod provisioning;
pub(super) mod running;

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::cluster::Context;
use super::transitions;
use super::Action;
use crate::crd::{Cluster, ClusterStatus, Condition, PhaseTransition, TaskCheckpoint};
use crate::metrics;
use crate::status::{Observation, StatusAggregator};
use crate::{Error, Result};

/// Persist a status proposal and return the updated record
///
/// A proposal equal to the stored status (timestamps aside) is not written,
/// which keeps repeated reconciles free of side effects. The write is a
/// compare-and-swap on the revision read with `cluster`.
pub(super) async fn update_status(
    cluster: &Cluster,
    ctx: &Context,
    mut status: ClusterStatus,
) -> Result<Cluster> {
    let name = cluster.key();
    let current = cluster.status.clone().unwrap_or_default();
    status.observed_generation = cluster.metadata.generation;
    status.observed_retry = cluster.retry_generation();
    status.revision = current.revision;

    let phase_changed = status.phase != current.phase;
    if phase_changed {
        if !transitions::is_allowed(current.phase, status.phase) {
            return Err(Error::internal_with_context(
                "reconciler",
                format!(
                    "refusing transition {} -> {} outside the transition table",
                    current.phase, status.phase
                ),
            ));
        }
        status.last_transition = Some(PhaseTransition {
            from: current.phase,
            to: status.phase,
            at: Utc::now(),
        });
    }

    if equivalent(&current, &status) {
        debug!(cluster = %name, phase = %status.phase, "status unchanged, skipping update");
        return Ok(cluster.clone());
    }

    let updated = ctx
        .statuses
        .patch_status(&name, cluster.revision(), &status)
        .await?;

    if phase_changed {
        info!(cluster = %name, from = %current.phase, to = %status.phase, "phase transition");
        metrics::record_phase_transition(current.phase, status.phase);
    }
    if phase_changed || !conditions_equivalent(&current.conditions, &status.conditions) {
        ctx.sink
            .on_phase_change(&name, current.phase, status.phase, status.conditions.clone())
            .await;
    }
    Ok(updated)
}

/// Move a cluster to deleting
pub(super) async fn begin_deletion(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    info!(cluster = %cluster.key(), phase = %cluster.phase(), "deletion requested");
    let mut agg = StatusAggregator::new(cluster);
    agg.observe(Observation::DeleteRequested);
    update_status(cluster, ctx, agg.into_status()).await?;
    Ok(Action::requeue(ctx.config.provisioning_requeue))
}

/// What remains of the per-transition deadline
///
/// The clock starts when the current phase was entered.
pub(super) fn transition_budget(cluster: &Cluster, ctx: &Context) -> Duration {
    let entered = cluster
        .status
        .as_ref()
        .and_then(|s| s.last_transition.as_ref())
        .map(|t| t.at);
    match entered {
        Some(at) => {
            let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
            ctx.config.transition_deadline.saturating_sub(elapsed)
        }
        None => ctx.config.transition_deadline,
    }
}

/// Provisioner message without the error wrapper
pub(super) fn failure_detail(error: &Error) -> String {
    match error {
        Error::Provision { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn equivalent(a: &ClusterStatus, b: &ClusterStatus) -> bool {
    a.phase == b.phase
        && a.cluster_id == b.cluster_id
        && a.message == b.message
        && a.observed_generation == b.observed_generation
        && a.observed_retry == b.observed_retry
        && conditions_equivalent(&a.conditions, &b.conditions)
        && checkpoints_equivalent(&a.checkpoints, &b.checkpoints)
}

fn conditions_equivalent(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

fn checkpoints_equivalent(a: &[TaskCheckpoint], b: &[TaskCheckpoint]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.task == y.task && x.handle == y.handle && x.state == y.state)
}
