//! Running: nothing to do until deletion is requested

use tracing::debug;

use super::begin_deletion;
use crate::controller::{Action, Context};
use crate::crd::Cluster;
use crate::Result;

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.is_deletion_requested() {
        return begin_deletion(cluster, ctx).await;
    }
    debug!("cluster running");
    Ok(Action::requeue(ctx.config.running_resync))
}
