//! Provisioned: wait for the control plane to answer its health check

use tracing::{debug, info};

use super::{begin_deletion, failure_detail, update_status};
use crate::controller::{Action, Context};
use crate::crd::{Cluster, ClusterPhase};
use crate::status::{Observation, StatusAggregator};
use crate::{Error, Result};

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.is_deletion_requested() {
        return begin_deletion(cluster, ctx).await;
    }

    let name = cluster.key();
    let cluster_id = cluster.cluster_id().ok_or_else(|| {
        Error::consistency_in_phase(
            &name,
            ClusterPhase::Provisioned,
            "provisioned without an assigned cluster ID",
        )
    })?;
    let endpoint = cluster
        .status
        .as_ref()
        .and_then(|s| s.apiserver_endpoint())
        .map(str::to_string);

    let probe = ctx.health.control_plane_healthy(cluster_id, endpoint);
    let (healthy, detail) = match tokio::time::timeout(ctx.config.attempt_timeout, probe).await {
        Ok(Ok(true)) => (true, None),
        Ok(Ok(false)) => (false, Some("control plane is not answering yet".to_string())),
        Ok(Err(e)) => (false, Some(format!("health check failed: {}", failure_detail(&e)))),
        Err(_) => (false, Some("health check timed out".to_string())),
    };

    let mut agg = StatusAggregator::new(cluster);
    agg.observe(Observation::HealthCheck { healthy, detail });
    update_status(cluster, ctx, agg.into_status()).await?;

    if healthy {
        info!("control plane healthy, cluster is running");
        Ok(Action::requeue(ctx.config.running_resync))
    } else {
        debug!("control plane not healthy yet");
        Ok(Action::requeue(ctx.config.health_requeue))
    }
}
