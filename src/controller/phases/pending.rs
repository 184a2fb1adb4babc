//! Pending: validate, assign a cluster ID and dispatch provisioning

use std::collections::HashSet;

use rand::Rng;
use tracing::{info, warn};

use super::{begin_deletion, update_status};
use crate::controller::{Action, Context};
use crate::crd::{validate_spec, Cluster};
use crate::status::{Observation, StatusAggregator};
use crate::{Error, Result, CCE_PREFIX, CLUSTER_ID_SUFFIX_LEN};

const CLUSTER_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_ID_ATTEMPTS: usize = 16;

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.is_deletion_requested() {
        return begin_deletion(cluster, ctx).await;
    }

    // The spec was validated on admission; a record written around the API
    // layer is rejected here without leaving pending.
    if let Err(e) = validate_spec(&cluster.key(), &cluster.spec) {
        warn!(error = %e, "cluster spec failed validation");
        return Err(e);
    }

    let cluster_id = match cluster.cluster_id() {
        Some(id) => id.to_string(),
        None => assign_cluster_id(ctx).await?,
    };
    info!(cluster_id = %cluster_id, "dispatching provisioning");

    let mut agg = StatusAggregator::new(cluster);
    agg.observe(Observation::ProvisioningDispatched { cluster_id });
    update_status(cluster, ctx, agg.into_status()).await?;
    Ok(Action::requeue(ctx.config.provisioning_requeue))
}

/// Random ID of the form `cce-xxxxxxxx`
pub(crate) fn generate_cluster_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CLUSTER_ID_SUFFIX_LEN)
        .map(|_| CLUSTER_ID_CHARSET[rng.gen_range(0..CLUSTER_ID_CHARSET.len())] as char)
        .collect();
    format!("{CCE_PREFIX}{suffix}")
}

async fn assign_cluster_id(ctx: &Context) -> Result<String> {
    let taken: HashSet<String> = ctx
        .specs
        .list_clusters()
        .await?
        .iter()
        .filter_map(|c| c.cluster_id().map(str::to_string))
        .collect();

    (0..MAX_ID_ATTEMPTS)
        .map(|_| generate_cluster_id())
        .find(|id| !taken.contains(id))
        .ok_or_else(|| {
            Error::internal_with_context("reconciler", "could not generate a unique cluster ID")
        })
}
