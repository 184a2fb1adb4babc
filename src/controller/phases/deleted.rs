//! Deleted: drop the record

use tracing::info;

use crate::controller::{Action, Context};
use crate::crd::Cluster;
use crate::Result;

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    ctx.statuses.remove_cluster(&cluster.key()).await?;
    info!("cluster record removed");
    Ok(Action::await_change())
}
