//! Deleting: tear down checkpointed resources, newest first

use tracing::{info, warn};

use super::{failure_detail, transition_budget, update_status};
use crate::controller::{Action, Context};
use crate::crd::{Cluster, ClusterPhase};
use crate::status::{Observation, StatusAggregator};
use crate::{Error, Result};

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.key();
    let live = cluster
        .status
        .as_ref()
        .map(|s| s.live_checkpoints())
        .unwrap_or_default();

    let mut current = cluster.clone();
    let mut agg = StatusAggregator::new(cluster);

    if !live.is_empty() {
        let cluster_id = cluster
            .cluster_id()
            .ok_or_else(|| {
                Error::consistency_in_phase(
                    &name,
                    ClusterPhase::Deleting,
                    "checkpoints recorded without an assigned cluster ID",
                )
            })?
            .to_string();

        for checkpoint in &live {
            if ctx.cancel.is_cancelled() {
                info!(task = %checkpoint.task, "shutdown requested, stopping at checkpoint");
                return Ok(Action::await_change());
            }

            let budget = transition_budget(&current, ctx);
            match ctx
                .orchestrator
                .teardown(&cluster_id, checkpoint, Some(budget))
                .await
            {
                Ok(()) => {
                    agg.observe(Observation::ResourceTornDown(checkpoint.task));
                    current = update_status(&current, ctx, agg.status().clone()).await?;
                }
                Err(e) => {
                    warn!(task = %checkpoint.task, error = %e, "teardown failed");
                    agg.observe(Observation::TeardownFailed {
                        task: checkpoint.task,
                        error: failure_detail(&e),
                    });
                    update_status(&current, ctx, agg.into_status()).await?;
                    return Ok(Action::await_change());
                }
            }
        }
    }

    agg.observe(Observation::TeardownComplete);
    update_status(&current, ctx, agg.into_status()).await?;
    info!("every cluster resource torn down");
    Ok(Action::requeue(ctx.config.provisioning_requeue))
}
