//! Provisioning stories: from submission to a running control plane

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cce_controller::controller::reconcile_key;
use cce_controller::crd::{ClusterPhase, TaskKind};
use cce_controller::provisioner::{Fault, SimulatedProvisioner};
use cce_controller::store::SpecStore;

use super::helpers::{assert_table_edges, managed_ha3_kubenet, Harness};

use ClusterPhase::*;

const TASKS: [TaskKind; 3] = [
    TaskKind::ReserveContainerNetwork,
    TaskKind::CreateMasters,
    TaskKind::AttachApiserverLb,
];

/// Story: a managed HA3 kubenet cluster walks the happy path
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_managed_ha3_kubenet_reaches_running() {
    let mut h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();

    let cluster = h.wait_for_phase("prod", Running).await;

    let transitions = h.transitions_of("prod");
    assert_eq!(
        transitions,
        vec![
            (Pending, Provisioning),
            (Provisioning, Provisioned),
            (Provisioned, Running),
        ]
    );
    assert_table_edges(&transitions);

    let status = cluster.status.unwrap();
    let cluster_id = status.cluster_id.as_deref().unwrap();
    assert!(cluster_id.starts_with("cce-"), "got {cluster_id}");
    assert_eq!(cluster_id.len(), "cce-".len() + 8);
    assert_eq!(status.checkpoints.len(), 3);
    for task in TASKS {
        assert_eq!(h.provisioner.created(task), 1, "{task}");
    }
    assert_eq!(h.provisioner.live_resources_of(cluster_id), 3);
}

/// Story: a cluster ID is assigned by the first transition
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_cluster_id_assigned_on_dispatch() {
    let h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();

    let cluster = h.wait_for_phase("prod", Running).await;
    let transition_at = cluster.status.as_ref().and_then(|s| s.last_transition.clone());
    assert!(transition_at.is_some());
    assert!(cluster.cluster_id().is_some());
    assert!(cluster.spec.cluster_id.is_empty());
}

/// Story: reconciling a settled cluster again changes nothing
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_repeated_reconcile_is_a_no_op() {
    let h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let settled = h.wait_for_phase("prod", Running).await;
    h.scheduler.wait_idle().await;

    let calls: Vec<u32> = TASKS.iter().map(|t| h.provisioner.calls(*t)).collect();

    reconcile_key("prod", h.ctx.clone()).await;
    reconcile_key("prod", h.ctx.clone()).await;

    let after = h.store.get_cluster("prod").await.unwrap();
    assert_eq!(after.phase(), Running);
    assert_eq!(after.revision(), settled.revision());
    let calls_after: Vec<u32> = TASKS.iter().map(|t| h.provisioner.calls(*t)).collect();
    assert_eq!(calls, calls_after);
}

/// Story: transient provisioner errors are retried without leaving provisioning
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_three_retryable_errors_then_success() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.inject(TaskKind::CreateMasters, Fault::Retryable, 3);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let cluster = h.wait_for_phase("prod", Running).await;

    assert_eq!(h.provisioner.calls(TaskKind::CreateMasters), 4);
    assert_eq!(h.provisioner.created(TaskKind::CreateMasters), 1);

    let transitions = h.transitions_of("prod");
    assert!(transitions.iter().all(|(_, to)| *to != CreateFailed));
    assert!(transitions.contains(&(Provisioning, Provisioned)));
    assert_table_edges(&transitions);

    let status = cluster.status.unwrap();
    assert!(status.checkpoint(TaskKind::CreateMasters).is_some());
}

/// Story: an unhealthy control plane holds the cluster in provisioned
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_health_check_gates_running() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.fail_health_probes(3);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    let transitions = h.transitions_of("prod");
    assert_eq!(transitions.last(), Some(&(Provisioned, Running)));
    assert_table_edges(&transitions);
}

/// Story: distinct clusters provision in parallel and get distinct IDs
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn story_clusters_reconcile_in_parallel() {
    let h = Harness::with_provisioner(
        SimulatedProvisioner::new().with_latency(Duration::from_millis(5)),
    );
    let names: Vec<String> = (0..5).map(|i| format!("cluster-{i}")).collect();

    for name in &names {
        h.service.submit(name, managed_ha3_kubenet()).await.unwrap();
    }

    let mut ids = HashSet::new();
    for name in &names {
        let cluster = h.wait_for_phase(name, Running).await;
        ids.insert(cluster.cluster_id().unwrap().to_string());
    }
    assert_eq!(ids.len(), names.len());
    assert_eq!(h.provisioner.live_resources(), names.len() * 3);
}

/// Story: shutdown stops at a checkpoint and a restart resumes from it
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_restart_resumes_from_checkpoints() {
    let first = Harness::with_provisioner(
        SimulatedProvisioner::new().with_latency(Duration::from_millis(20)),
    );
    first.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    first.wait_for_phase("prod", Provisioning).await;
    first.scheduler.shutdown().await;

    // Same store and provisioner, fresh controller
    let record = first.store.get_cluster("prod").await.unwrap();
    let done_before = record
        .status
        .as_ref()
        .map(|s| s.checkpoints.len())
        .unwrap_or(0);

    let ctx = Arc::new(
        cce_controller::controller::Context::builder(
            first.store.clone(),
            first.store.clone(),
            first.provisioner.clone(),
            first.provisioner.clone(),
        )
        .config(cce_controller::config::ControllerConfig::fast())
        .build(),
    );
    let scheduler = cce_controller::controller::Scheduler::new(ctx);
    scheduler.enqueue_all().await.unwrap();
    first.wait_for_phase("prod", Running).await;

    assert!(done_before <= 3);
    for task in TASKS {
        assert_eq!(first.provisioner.created(task), 1, "{task}");
    }
    scheduler.shutdown().await;
}
