//! create_failed and delete_failed: stable until an operator intervenes
//!
//! An operator retry is a bump of the retry annotation the status has not
//! observed yet. Spec edits do not count. Reconciling a failed cluster
//! without a retry changes nothing.

use tracing::{debug, info};

use super::{begin_deletion, update_status};
use crate::controller::{Action, Context};
use crate::crd::Cluster;
use crate::status::{Observation, StatusAggregator};
use crate::Result;

pub(crate) async fn handle_create_failed(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.is_deletion_requested() {
        return begin_deletion(cluster, ctx).await;
    }
    if cluster.has_pending_retry() {
        info!("operator retry, resuming provisioning from checkpoints");
        return operator_retry(cluster, ctx).await;
    }
    debug!("create failed, waiting for operator");
    Ok(Action::await_change())
}

pub(crate) async fn handle_delete_failed(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.has_pending_retry() {
        info!("operator retry, resuming teardown");
        return operator_retry(cluster, ctx).await;
    }
    debug!("delete failed, waiting for operator");
    Ok(Action::await_change())
}

async fn operator_retry(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let mut agg = StatusAggregator::new(cluster);
    agg.observe(Observation::OperatorRetry);
    update_status(cluster, ctx, agg.into_status()).await?;
    Ok(Action::requeue(ctx.config.provisioning_requeue))
}
