//! Deletion stories: teardown, delete protection and teardown failures

use std::time::Duration;

use cce_controller::crd::{Cluster, ClusterPhase, TaskKind};
use cce_controller::provisioner::{Fault, SimulatedProvisioner};
use cce_controller::status::CONDITION_DELETION_BLOCKED;
use cce_controller::store::{ClusterAdmission, SpecStore};
use cce_controller::Error;

use super::helpers::{assert_table_edges, managed_ha3_kubenet, Harness};

use ClusterPhase::*;

/// Story: deleting a running cluster tears down every resource
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_delete_running_cluster() {
    let mut h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let running = h.wait_for_phase("prod", Running).await;
    let cluster_id = running.cluster_id().unwrap().to_string();

    h.service.delete("prod").await.unwrap();
    h.wait_for_removal("prod").await;

    let transitions = h.transitions_of("prod");
    assert!(transitions.ends_with(&[(Running, Deleting), (Deleting, Deleted)]));
    assert_table_edges(&transitions);

    assert_eq!(h.provisioner.live_resources_of(&cluster_id), 0);
    for task in [
        TaskKind::AttachApiserverLb,
        TaskKind::CreateMasters,
        TaskKind::ReserveContainerNetwork,
    ] {
        assert_eq!(h.provisioner.torn_down(task), 1, "{task}");
    }
}

/// Story: delete protection rejects the request and keeps the cluster
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_forbid_delete_rejects_request() {
    let h = Harness::new();
    let mut spec = managed_ha3_kubenet();
    spec.forbid_delete = true;
    h.service.submit("prod", spec).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    let err = h.service.delete("prod").await.unwrap_err();
    assert!(matches!(err, Error::Policy { .. }), "got {err:?}");

    let cluster = h.store.get_cluster("prod").await.unwrap();
    assert!(!cluster.is_deletion_requested());
    assert_eq!(cluster.phase(), Running);
}

/// Story: a delete intent written around the service is still refused
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_forbid_delete_blocks_reconciler() {
    let h = Harness::new();
    let mut errors = h.sink.subscribe_errors();
    let mut spec = managed_ha3_kubenet();
    spec.forbid_delete = true;
    h.service.submit("prod", spec).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    h.store.request_deletion("prod").await.unwrap();
    h.scheduler.enqueue("prod");

    let (cluster, message) = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no reconcile error reported")
        .unwrap();
    assert_eq!(cluster, "prod");
    assert!(message.contains("policy"), "got {message}");

    h.scheduler.wait_idle().await;
    let cluster = h.store.get_cluster("prod").await.unwrap();
    assert_eq!(cluster.phase(), Running);
    let status = cluster.status.unwrap();
    assert!(status.conditions.iter().any(|c| c.type_ == CONDITION_DELETION_BLOCKED));
    assert_eq!(h.provisioner.live_resources(), 3);
}

/// Story: a blocked delete intent does not stop provisioning
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_blocked_delete_intent_still_provisions() {
    let mut h = Harness::new();
    let mut errors = h.sink.subscribe_errors();
    let mut spec = managed_ha3_kubenet();
    spec.apply_defaults();
    spec.forbid_delete = true;

    // The intent lands before the first reconcile ever runs
    h.store
        .create_cluster(Cluster::new("prod", spec))
        .await
        .unwrap();
    h.store.request_deletion("prod").await.unwrap();
    h.scheduler.enqueue("prod");

    let running = h.wait_for_phase("prod", Running).await;
    assert!(running.is_deletion_requested());
    let status = running.status.as_ref().unwrap();
    assert!(status.conditions.iter().any(|c| c.type_ == CONDITION_DELETION_BLOCKED));

    let (cluster, message) = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no reconcile error reported")
        .unwrap();
    assert_eq!(cluster, "prod");
    assert!(message.contains("policy"), "got {message}");

    let transitions = h.transitions_of("prod");
    assert!(transitions.iter().all(|(_, to)| *to != Deleting));
    assert_table_edges(&transitions);
    assert_eq!(h.provisioner.live_resources(), 3);
}

/// Story: a failed teardown parks the cluster until deletion is re-requested
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_teardown_failure_then_rerequest() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.inject_teardown(TaskKind::CreateMasters, Fault::Fatal, 1);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    h.service.delete("prod").await.unwrap();
    let failed = h.wait_for_phase("prod", DeleteFailed).await;
    let status = failed.status.as_ref().unwrap();
    assert_eq!(status.live_checkpoints().len(), 2);

    // Stable without intervention
    h.scheduler.enqueue("prod");
    h.scheduler.wait_idle().await;
    assert_eq!(h.store.get_cluster("prod").await.unwrap().phase(), DeleteFailed);

    h.service.delete("prod").await.unwrap();
    h.wait_for_removal("prod").await;

    let transitions = h.transitions_of("prod");
    assert!(transitions.contains(&(Deleting, DeleteFailed)));
    assert!(transitions.contains(&(DeleteFailed, Deleting)));
    assert_table_edges(&transitions);
    assert_eq!(h.provisioner.live_resources(), 0);
}
