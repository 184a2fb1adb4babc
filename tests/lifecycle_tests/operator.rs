//! Operator stories: failed terminals, retries and consistency repair

use std::time::Duration;

use chrono::Utc;

use cce_controller::crd::{ClusterPhase, PhaseTransition, TaskKind};
use cce_controller::provisioner::{Fault, SimulatedProvisioner};
use cce_controller::store::{ClusterAdmission, SpecStore};
use cce_controller::Error;

use super::helpers::{assert_table_edges, managed_ha3_kubenet, Harness};

use ClusterPhase::*;

/// Story: a fatal provisioner error lands in create_failed and stays there
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_fatal_error_is_stable_until_retry() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.inject(TaskKind::CreateMasters, Fault::Fatal, 1);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let failed = h.wait_for_phase("prod", CreateFailed).await;
    h.scheduler.wait_idle().await;
    assert_eq!(h.provisioner.calls(TaskKind::CreateMasters), 1);

    // Reconciling again without remediation changes nothing
    h.scheduler.enqueue("prod");
    h.scheduler.wait_idle().await;
    let still = h.store.get_cluster("prod").await.unwrap();
    assert_eq!(still.phase(), CreateFailed);
    assert_eq!(still.revision(), failed.revision());
    assert_eq!(h.provisioner.calls(TaskKind::CreateMasters), 1);

    // Retry resumes from the network checkpoint
    h.service.retry("prod").await.unwrap();
    h.wait_for_phase("prod", Running).await;

    assert_eq!(h.provisioner.calls(TaskKind::ReserveContainerNetwork), 1);
    assert_eq!(h.provisioner.calls(TaskKind::CreateMasters), 2);

    let transitions = h.transitions_of("prod");
    assert!(transitions.contains(&(Provisioning, CreateFailed)));
    assert!(transitions.contains(&(CreateFailed, Provisioning)));
    assert_table_edges(&transitions);
}

/// Story: editing a failed cluster's spec is not a retry
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_spec_edit_keeps_create_failed() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.inject(TaskKind::CreateMasters, Fault::Fatal, 1);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let failed = h.wait_for_phase("prod", CreateFailed).await;
    h.scheduler.wait_idle().await;

    let mut noted = managed_ha3_kubenet();
    noted.description = "just a note".to_string();
    let updated = h.service.update("prod", noted).await.unwrap();
    assert_eq!(updated.metadata.generation, Some(2));

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.scheduler.wait_idle().await;

    let still = h.store.get_cluster("prod").await.unwrap();
    assert_eq!(still.phase(), CreateFailed);
    assert_eq!(still.spec.description, "just a note");
    assert_eq!(still.revision(), failed.revision());
    assert_eq!(h.provisioner.calls(TaskKind::CreateMasters), 1);

    let transitions = h.transitions_of("prod");
    assert!(!transitions.contains(&(CreateFailed, Provisioning)));
}

/// Story: deleting a failed cluster tears down what was created
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_delete_create_failed_cluster() {
    let provisioner = SimulatedProvisioner::new();
    provisioner.inject(TaskKind::AttachApiserverLb, Fault::Fatal, 1);
    let mut h = Harness::with_provisioner(provisioner);

    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    h.wait_for_phase("prod", CreateFailed).await;
    assert_eq!(h.provisioner.live_resources(), 2);

    h.service.delete("prod").await.unwrap();
    h.wait_for_removal("prod").await;

    assert_eq!(h.provisioner.live_resources(), 0);
    assert_eq!(h.provisioner.torn_down(TaskKind::AttachApiserverLb), 0);
    let transitions = h.transitions_of("prod");
    assert!(transitions.contains(&(CreateFailed, Deleting)));
    assert_table_edges(&transitions);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_outside_failed_phase_is_refused() {
    let h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    let err = h.service.retry("prod").await.unwrap_err();
    assert!(matches!(err, Error::Policy { .. }), "got {err:?}");
}

/// Story: a phase written outside the reconciler halts it until repaired
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_consistency_error_requires_repair() {
    let h = Harness::new();
    let mut errors = h.sink.subscribe_errors();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let running = h.wait_for_phase("prod", Running).await;
    h.scheduler.wait_idle().await;

    // Someone flips the phase without recording a transition
    let mut tampered = running.status.clone().unwrap();
    tampered.phase = Provisioned;
    h.store.repair_status("prod", tampered).await.unwrap();
    h.scheduler.enqueue("prod");

    let (cluster, message) = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no reconcile error reported")
        .unwrap();
    assert_eq!(cluster, "prod");
    assert!(message.contains("consistency"), "got {message}");

    h.scheduler.wait_idle().await;
    assert_eq!(h.store.get_cluster("prod").await.unwrap().phase(), Provisioned);

    // The operator declares the real phase and the reconciler carries on
    let repaired = h.service.repair("prod", Running).await.unwrap();
    let status = repaired.status.as_ref().unwrap();
    assert_eq!(
        status.last_transition.as_ref().map(|t| t.to),
        Some(Running)
    );
    h.scheduler.wait_idle().await;
    assert_eq!(h.store.get_cluster("prod").await.unwrap().phase(), Running);
    assert!(errors.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repair_accepts_a_consistent_status() {
    let h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    let running = h.wait_for_phase("prod", Running).await;
    h.scheduler.wait_idle().await;

    let mut status = running.status.clone().unwrap();
    status.last_transition = Some(PhaseTransition {
        from: Provisioned,
        to: Running,
        at: Utc::now(),
    });
    let repaired = h.store.repair_status("prod", status).await.unwrap();
    assert_eq!(repaired.revision(), running.revision() + 1);
}

/// Story: modifiable fields change in place, readonly ones are refused
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_spec_update_on_running_cluster() {
    let h = Harness::new();
    h.service.submit("prod", managed_ha3_kubenet()).await.unwrap();
    h.wait_for_phase("prod", Running).await;

    let mut renamed = managed_ha3_kubenet();
    renamed.cluster_name = "renamed".to_string();
    let updated = h.service.update("prod", renamed).await.unwrap();
    assert_eq!(updated.spec.cluster_name, "renamed");
    assert_eq!(updated.metadata.generation, Some(2));

    let mut moved = managed_ha3_kubenet();
    moved.vpc_id = "vpc-other".to_string();
    let err = h.service.update("prod", moved).await.unwrap_err();
    assert!(err.violations().iter().any(|v| v.field == "vpcID"));

    let mut regrouped = managed_ha3_kubenet();
    regrouped.plugins = vec!["core-dns".to_string()];
    regrouped.k8s_custom_config.pause_image = "registry.local/pause:3.9".to_string();
    regrouped.resource_group_id = "rg-other".to_string();
    let err = h.service.update("prod", regrouped).await.unwrap_err();
    for field in ["plugins", "k8sCustomConfig", "resourceGroupID"] {
        assert!(err.violations().iter().any(|v| v.field == field), "{field}");
    }
    let stored = h.store.get_cluster("prod").await.unwrap();
    assert!(stored.spec.plugins.is_empty());
    assert!(stored.spec.resource_group_id.is_empty());

    h.scheduler.wait_idle().await;
    assert_eq!(h.store.get_cluster("prod").await.unwrap().phase(), Running);
}
