//! Provisioning: run the remaining tasks of the plan, checkpointing each

use tracing::{debug, info, warn};

use super::{failure_detail, transition_budget, update_status};
use crate::controller::{Action, Context};
use crate::crd::{Cluster, ClusterPhase};
use crate::orchestrator::{plan, remaining};
use crate::status::{Observation, StatusAggregator};
use crate::{Error, Result};

pub(crate) async fn handle(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.key();
    if cluster.is_deletion_requested() {
        debug!("delete requested; finishing the provisioning attempt first");
    }

    let cluster_id = cluster
        .cluster_id()
        .ok_or_else(|| {
            Error::consistency_in_phase(
                &name,
                ClusterPhase::Provisioning,
                "provisioning without an assigned cluster ID",
            )
        })?
        .to_string();

    let tasks = remaining(plan(&cluster_id, &cluster.spec), cluster.status.as_ref());
    debug!(remaining = tasks.len(), "resuming provisioning plan");

    let mut current = cluster.clone();
    let mut agg = StatusAggregator::new(cluster);

    for task in &tasks {
        if ctx.cancel.is_cancelled() {
            info!(task = %task.kind, "shutdown requested, stopping at checkpoint");
            return Ok(Action::await_change());
        }

        agg.observe(Observation::WaitingForTask(task.kind));
        current = update_status(&current, ctx, agg.status().clone()).await?;

        let budget = transition_budget(&current, ctx);
        let mut retries = Vec::new();
        let result = ctx
            .orchestrator
            .run_task(task, Some(budget), |attempt, e| {
                retries.push((attempt, failure_detail(e)))
            })
            .await;

        for (attempt, error) in &retries {
            agg.observe(Observation::TaskRetrying {
                task: task.kind,
                attempt: *attempt,
                error: error.clone(),
            });
        }

        match result {
            Ok(handle) => {
                agg.observe(Observation::TaskCompleted {
                    task: task.kind,
                    handle,
                    attempts: retries.len() as u32 + 1,
                });
                current = update_status(&current, ctx, agg.status().clone()).await?;
            }
            Err(e) => {
                warn!(task = %task.kind, error = %e, "provisioning task failed");
                agg.observe(Observation::TaskFailed {
                    task: task.kind,
                    error: failure_detail(&e),
                });
                update_status(&current, ctx, agg.into_status()).await?;
                return Ok(Action::await_change());
            }
        }
    }

    agg.observe(Observation::AllTasksReady);
    update_status(&current, ctx, agg.into_status()).await?;
    info!("all provisioning tasks complete");
    Ok(Action::requeue(ctx.config.provisioning_requeue))
}
