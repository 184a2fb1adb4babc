//! Cluster controller implementation
//!
//! This module implements the reconciliation logic for Cluster records.
//! It follows the controller pattern: observe the current phase, decide the
//! single next transition and persist it.

use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::phases;
use super::Action;
use crate::config::ControllerConfig;
use crate::crd::{Cluster, ClusterPhase};
use crate::metrics::ReconcileTimer;
use crate::orchestrator::Orchestrator;
use crate::provisioner::{HealthProbe, IaasProvisioner};
use crate::status::{LogSink, Observation, StatusAggregator, StatusSink};
use crate::store::{SpecStore, StatusStore};
use crate::{Error, DO_NOT_HANDLE};

/// Controller context containing shared state and clients
///
/// Every seam is a trait object so tests can substitute mocks.
///
/// # Example
///
/// ```ignore
/// let ctx = Context::builder(store.clone(), store, provisioner.clone(), provisioner)
///     .config(config)
///     .sink(Arc::new(LogSink))
///     .build();
/// ```
pub struct Context {
    /// Read side of the cluster records
    pub specs: Arc<dyn SpecStore>,
    /// Reconciler-owned status writes
    pub statuses: Arc<dyn StatusStore>,
    /// Runs provisioning tasks against the IaaS provisioner
    pub orchestrator: Orchestrator,
    /// Control-plane health check
    pub health: Arc<dyn HealthProbe>,
    /// Receives every status change
    pub sink: Arc<dyn StatusSink>,
    /// Timings and retry budgets
    pub config: ControllerConfig,
    /// Cancelled on shutdown; honored at task checkpoints
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        specs: Arc<dyn SpecStore>,
        statuses: Arc<dyn StatusStore>,
        provisioner: Arc<dyn IaasProvisioner>,
        health: Arc<dyn HealthProbe>,
    ) -> ContextBuilder {
        ContextBuilder::new(specs, statuses, provisioner, health)
    }
}

/// Builder for constructing [`Context`] instances
///
/// Defaults: [`ControllerConfig::default`], a [`LogSink`] and a fresh
/// cancellation token.
pub struct ContextBuilder {
    specs: Arc<dyn SpecStore>,
    statuses: Arc<dyn StatusStore>,
    provisioner: Arc<dyn IaasProvisioner>,
    health: Arc<dyn HealthProbe>,
    sink: Option<Arc<dyn StatusSink>>,
    config: ControllerConfig,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(
        specs: Arc<dyn SpecStore>,
        statuses: Arc<dyn StatusStore>,
        provisioner: Arc<dyn IaasProvisioner>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            specs,
            statuses,
            provisioner,
            health,
            sink: None,
            config: ControllerConfig::default(),
            cancel: None,
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the status sink
    pub fn sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share a cancellation token with the caller
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let orchestrator = Orchestrator::new(
            self.provisioner,
            self.config.provision_retry.clone(),
            self.config.teardown_retry.clone(),
            self.config.attempt_timeout,
        );
        Context {
            specs: self.specs,
            statuses: self.statuses,
            orchestrator,
            health: self.health,
            sink: self.sink.unwrap_or_else(|| Arc::new(LogSink)),
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Reconcile a Cluster record
///
/// Reads the current phase, decides the single next transition and
/// persists it. Calling it again with no external change is a no-op after
/// the first successful transition.
///
/// # Returns
///
/// An [`Action`] telling the scheduler when to look at the record again, or
/// an error that [`error_policy`] turns into one.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.key(), phase = %cluster.phase()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cluster.annotations().contains_key(DO_NOT_HANDLE) {
        debug!("record opted out of reconciliation");
        return Ok(Action::await_change());
    }

    check_consistency(&cluster)?;

    let phase = cluster.phase();
    debug!(?phase, "reconciling cluster");

    let cluster = if cluster.is_deletion_requested()
        && cluster.spec.forbid_delete
        && !matches!(phase, ClusterPhase::Deleting | ClusterPhase::Deleted)
    {
        Arc::new(reject_deletion(&cluster, &ctx).await?)
    } else {
        cluster
    };

    match phase {
        ClusterPhase::Pending => phases::pending::handle(&cluster, &ctx).await,
        ClusterPhase::Provisioning => phases::provisioning::handle(&cluster, &ctx).await,
        ClusterPhase::Provisioned => phases::provisioned::handle(&cluster, &ctx).await,
        ClusterPhase::Running => phases::running::handle(&cluster, &ctx).await,
        ClusterPhase::CreateFailed => phases::failed::handle_create_failed(&cluster, &ctx).await,
        ClusterPhase::Deleting => phases::deleting::handle(&cluster, &ctx).await,
        ClusterPhase::Deleted => phases::deleted::handle(&cluster, &ctx).await,
        ClusterPhase::DeleteFailed => phases::failed::handle_delete_failed(&cluster, &ctx).await,
    }
}

/// Fetch a record by key and reconcile it
///
/// This is what the scheduler runs. Errors are reported to the sink and
/// the metrics, then mapped to an [`Action`] by [`error_policy`]; a record
/// that no longer exists needs nothing.
pub async fn reconcile_key(name: &str, ctx: Arc<Context>) -> Action {
    let cluster = match ctx.specs.get_cluster(name).await {
        Ok(cluster) => Arc::new(cluster),
        Err(Error::NotFound { .. }) => {
            debug!(cluster = %name, "record gone, nothing to reconcile");
            return Action::await_change();
        }
        Err(e) => {
            error!(cluster = %name, error = %e, "failed to read cluster record");
            ctx.sink.on_reconcile_error(name, &e).await;
            return Action::requeue(ctx.config.error_requeue);
        }
    };

    let timer = ReconcileTimer::start(cluster.phase());
    match reconcile(cluster.clone(), ctx.clone()).await {
        Ok(action) => {
            timer.success();
            action
        }
        Err(e) => {
            timer.error(e.kind());
            ctx.sink.on_reconcile_error(name, &e).await;
            error_policy(&cluster, &e, &ctx)
        }
    }
}

/// Decide what to do after a failed reconcile
///
/// Errors that need a human (validation, policy, consistency) wait for the
/// record to change. Everything retryable is requeued after
/// `error_requeue`.
pub fn error_policy(cluster: &Cluster, error: &Error, ctx: &Context) -> Action {
    error!(
        ?error,
        cluster = %cluster.key(),
        kind = error.kind(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.config.error_requeue)
    } else {
        Action::await_change()
    }
}

/// The recorded phase must be the target of the last recorded transition
///
/// Anything else means the phase was written by someone other than the
/// reconciler; the operator has to repair the record.
fn check_consistency(cluster: &Cluster) -> Result<(), Error> {
    let Some(status) = cluster.status.as_ref() else {
        return Ok(());
    };
    let expected = status
        .last_transition
        .as_ref()
        .map(|t| t.to)
        .unwrap_or(ClusterPhase::Pending);
    if status.phase != expected {
        warn!(recorded = %status.phase, expected = %expected, "phase mutated outside the reconciler");
        return Err(Error::consistency_in_phase(
            cluster.key(),
            status.phase,
            format!(
                "phase is {} but the last recorded transition ended in {expected}",
                status.phase
            ),
        ));
    }
    Ok(())
}

/// Refuse the delete edge while delete protection is on
///
/// Records `DeletionBlocked` and reports the policy error to the sink. The
/// returned record has its delete intent masked so the phase handler keeps
/// driving the cluster as if no delete had been requested.
async fn reject_deletion(cluster: &Cluster, ctx: &Context) -> Result<Cluster, Error> {
    info!("deletion requested but delete protection is enabled");
    let mut agg = StatusAggregator::new(cluster);
    agg.observe(Observation::DeleteBlocked);
    let mut updated = phases::update_status(cluster, ctx, agg.into_status()).await?;

    let err = Error::policy(
        cluster.key(),
        "delete protection is enabled (forbidDelete=true)",
    );
    warn!(error = %err, "delete transition rejected");
    ctx.sink.on_reconcile_error(&cluster.key(), &err).await;

    updated.metadata.deletion_timestamp = None;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterHa, ClusterSpec, ClusterStatus, ClusterType, ConditionStatus, ContainerNetworkConfig,
        MasterConfig, MasterType, PhaseTransition, ResourceHandle, TaskKind,
    };
    use crate::provisioner::{MockHealthProbe, MockIaasProvisioner};
    use crate::retry::RetryConfig;
    use crate::status::{MockStatusSink, CONDITION_DELETION_BLOCKED};
    use crate::store::{MockSpecStore, MockStatusStore};
    use crate::RETRY_ANNOTATION;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex;

    /// Create a valid managed cluster spec for testing
    fn sample_spec() -> ClusterSpec {
        let mut spec = ClusterSpec {
            cluster_name: "prod".to_string(),
            cluster_type: Some(ClusterType::Normal),
            vpc_id: "vpc-1".to_string(),
            vpc_cidr: "192.168.0.0/16".to_string(),
            master_config: MasterConfig {
                master_type: Some(MasterType::Managed),
                cluster_ha: Some(ClusterHa::Medium),
                ..Default::default()
            },
            container_network_config: ContainerNetworkConfig {
                cluster_pod_cidr: "10.0.0.0/16".to_string(),
                cluster_ip_service_cidr: "172.16.0.0/16".to_string(),
                lb_service_vpc_subnet_id: "sbn-lb".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        spec.apply_defaults();
        spec
    }

    fn sample_cluster(name: &str) -> Cluster {
        let mut cluster = Cluster::new(name, sample_spec());
        cluster.metadata.generation = Some(1);
        cluster
    }

    /// Create a cluster whose status looks like the reconciler wrote it
    fn cluster_in(phase: ClusterPhase) -> Cluster {
        let mut cluster = sample_cluster("prod");
        let mut status = ClusterStatus::with_phase(phase);
        status.revision = 3;
        status.observed_generation = Some(1);
        if phase != ClusterPhase::Pending {
            status.cluster_id = Some("cce-abcd1234".to_string());
            status.last_transition = Some(PhaseTransition {
                from: ClusterPhase::Pending,
                to: phase,
                at: Utc::now(),
            });
        }
        cluster.status = Some(status);
        cluster
    }

    fn request_deletion(cluster: &mut Cluster) {
        cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
    }

    /// Captured status writes, so tests verify phases without withf() matchers
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<ClusterStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: ClusterStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn phases(&self) -> Vec<ClusterPhase> {
            self.updates.lock().unwrap().iter().map(|s| s.phase).collect()
        }

        fn last(&self) -> Option<ClusterStatus> {
            self.updates.lock().unwrap().last().cloned()
        }

        fn was_updated(&self) -> bool {
            !self.updates.lock().unwrap().is_empty()
        }
    }

    /// Status store mock that records every write and echoes it back
    fn capturing_status_store(base: Cluster, capture: &StatusCapture) -> MockStatusStore {
        let capture = capture.clone();
        let mut store = MockStatusStore::new();
        store
            .expect_patch_status()
            .returning(move |_, expected, status| {
                capture.record(status.clone());
                let mut updated = base.clone();
                let mut written = status.clone();
                written.revision = expected + 1;
                updated.status = Some(written);
                Ok(updated)
            });
        store
    }

    fn quiet_sink() -> MockStatusSink {
        let mut sink = MockStatusSink::new();
        sink.expect_on_phase_change().returning(|_, _, _, _| ());
        sink.expect_on_reconcile_error().returning(|_, _| ());
        sink
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            provision_retry: RetryConfig::fast(3),
            teardown_retry: RetryConfig::fast(2),
            ..ControllerConfig::fast()
        }
    }

    struct Mocks {
        specs: MockSpecStore,
        statuses: MockStatusStore,
        provisioner: MockIaasProvisioner,
        health: MockHealthProbe,
        sink: MockStatusSink,
    }

    impl Mocks {
        fn new(statuses: MockStatusStore) -> Self {
            let mut specs = MockSpecStore::new();
            specs.expect_list_clusters().returning(|| Ok(vec![]));
            Self {
                specs,
                statuses,
                provisioner: MockIaasProvisioner::new(),
                health: MockHealthProbe::new(),
                sink: quiet_sink(),
            }
        }

        fn context(self) -> Arc<Context> {
            Arc::new(
                Context::builder(
                    Arc::new(self.specs),
                    Arc::new(self.statuses),
                    Arc::new(self.provisioner),
                    Arc::new(self.health),
                )
                .config(fast_config())
                .sink(Arc::new(self.sink))
                .build(),
            )
        }
    }

    /// Provisioner mock that succeeds every create call
    fn healthy_provisioner() -> MockIaasProvisioner {
        let mut provisioner = MockIaasProvisioner::new();
        provisioner
            .expect_create_network()
            .returning(|_| Ok(ResourceHandle::new("net-1")));
        provisioner
            .expect_create_master()
            .returning(|_| Ok(ResourceHandle::new("masters-1")));
        provisioner.expect_create_load_balancer().returning(|_| {
            Ok(ResourceHandle::new("blb-1").with_endpoint("https://blb.internal:6443"))
        });
        provisioner
    }

    // =========================================================================
    // Pending Stories
    // =========================================================================

    mod pending_phase {
        use super::*;

        /// Story: a valid pending cluster gets an ID and starts provisioning
        #[tokio::test]
        async fn story_pending_cluster_is_dispatched() {
            let cluster = sample_cluster("prod");
            let capture = StatusCapture::default();
            let ctx = Mocks::new(capturing_status_store(cluster.clone(), &capture)).context();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();

            assert!(action.requeue_after().is_some());
            let written = capture.last().unwrap();
            assert_eq!(written.phase, ClusterPhase::Provisioning);
            assert!(written
                .cluster_id
                .as_deref()
                .is_some_and(|id| id.starts_with("cce-")));
            assert_eq!(written.observed_generation, Some(1));
            let transition = written.last_transition.unwrap();
            assert_eq!(transition.from, ClusterPhase::Pending);
            assert_eq!(transition.to, ClusterPhase::Provisioning);
        }

        /// Story: an invalid spec is rejected without leaving pending
        #[tokio::test]
        async fn story_invalid_spec_stays_pending() {
            let mut cluster = sample_cluster("prod");
            cluster.spec.master_config.master_type = Some(MasterType::Serverless);
            cluster.spec.master_config.cluster_ha = Some(ClusterHa::Medium);

            let capture = StatusCapture::default();
            let ctx = Mocks::new(capturing_status_store(cluster.clone(), &capture)).context();

            let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
            assert_eq!(err.kind(), "validation");
            assert!(!capture.was_updated());
        }

        #[tokio::test]
        async fn test_delete_before_dispatch_goes_to_deleting() {
            let mut cluster = sample_cluster("prod");
            request_deletion(&mut cluster);
            let capture = StatusCapture::default();
            let ctx = Mocks::new(capturing_status_store(cluster.clone(), &capture)).context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(capture.phases(), vec![ClusterPhase::Deleting]);
        }

        #[tokio::test]
        async fn test_opted_out_record_is_ignored() {
            let mut cluster = sample_cluster("prod");
            cluster
                .annotations_mut()
                .insert(DO_NOT_HANDLE.to_string(), "true".to_string());
            let ctx = Mocks::new(MockStatusStore::new()).context();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    // =========================================================================
    // Provisioning Stories
    // =========================================================================

    mod provisioning_phase {
        use super::*;

        /// Story: every task is checkpointed before the next one starts
        #[tokio::test]
        async fn story_provisioning_checkpoints_each_task() {
            let cluster = cluster_in(ClusterPhase::Provisioning);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks.provisioner = healthy_provisioner();
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();

            let last = capture.last().unwrap();
            assert_eq!(last.phase, ClusterPhase::Provisioned);
            let tasks: Vec<TaskKind> = last.checkpoints.iter().map(|c| c.task).collect();
            assert_eq!(
                tasks,
                vec![
                    TaskKind::ReserveContainerNetwork,
                    TaskKind::CreateMasters,
                    TaskKind::AttachApiserverLb
                ]
            );
            // Waiting and completion writes for each of the three tasks, then the transition
            assert_eq!(capture.phases().len(), 7);
        }

        /// Story: a checkpointed task is not run again
        #[tokio::test]
        async fn story_provisioning_resumes_from_checkpoints() {
            let mut cluster = cluster_in(ClusterPhase::Provisioning);
            if let Some(status) = cluster.status.as_mut() {
                status.record_checkpoint(TaskKind::ReserveContainerNetwork, ResourceHandle::new("net-1"));
                status.record_checkpoint(TaskKind::CreateMasters, ResourceHandle::new("masters-1"));
            }
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            // No network or master expectations: calling them would panic
            mocks
                .provisioner
                .expect_create_load_balancer()
                .times(1)
                .returning(|_| Ok(ResourceHandle::new("blb-1")));
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(capture.last().unwrap().phase, ClusterPhase::Provisioned);
        }

        /// Story: a fatal provisioner error moves the cluster to create_failed
        #[tokio::test]
        async fn story_fatal_error_fails_creation() {
            let cluster = cluster_in(ClusterPhase::Provisioning);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks
                .provisioner
                .expect_create_network()
                .returning(|_| Ok(ResourceHandle::new("net-1")));
            mocks.provisioner.expect_create_master().returning(|r| {
                Err(Error::provision_fatal(&r.cluster_id, "create-masters", "quota exceeded"))
            });
            let ctx = mocks.context();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();

            assert_eq!(action, Action::await_change());
            let last = capture.last().unwrap();
            assert_eq!(last.phase, ClusterPhase::CreateFailed);
            assert_eq!(last.checkpoints.len(), 1);
            assert_eq!(
                last.message.as_deref(),
                Some("create-masters failed: quota exceeded")
            );
        }

        /// Story: delete intent does not interrupt an in-flight attempt
        #[tokio::test]
        async fn story_delete_waits_for_provisioning() {
            let mut cluster = cluster_in(ClusterPhase::Provisioning);
            request_deletion(&mut cluster);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks.provisioner = healthy_provisioner();
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(capture.last().unwrap().phase, ClusterPhase::Provisioned);
            assert!(!capture.phases().contains(&ClusterPhase::Deleting));
        }

        #[tokio::test]
        async fn test_cancelled_context_stops_before_next_task() {
            let cluster = cluster_in(ClusterPhase::Provisioning);
            let capture = StatusCapture::default();
            let mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            let ctx = mocks.context();
            ctx.cancel.cancel();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
            assert!(!capture.was_updated());
        }
    }

    // =========================================================================
    // Health and Running Stories
    // =========================================================================

    mod health_phase {
        use super::*;

        /// Story: a healthy control plane makes the cluster running
        #[tokio::test]
        async fn story_healthy_control_plane_runs() {
            let cluster = cluster_in(ClusterPhase::Provisioned);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks
                .health
                .expect_control_plane_healthy()
                .returning(|_, _| Ok(true));
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            let last = capture.last().unwrap();
            assert_eq!(last.phase, ClusterPhase::Running);
            assert!(last
                .conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == ConditionStatus::True));
        }

        #[tokio::test]
        async fn test_unhealthy_control_plane_requeues() {
            let cluster = cluster_in(ClusterPhase::Provisioned);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks
                .health
                .expect_control_plane_healthy()
                .returning(|_, _| Ok(false));
            let ctx = mocks.context();
            let health_requeue = ctx.config.health_requeue;

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::requeue(health_requeue));
            assert_eq!(capture.last().unwrap().phase, ClusterPhase::Provisioned);
        }

        /// Story: a running cluster with no change is left alone
        #[tokio::test]
        async fn story_running_cluster_is_stable() {
            let cluster = cluster_in(ClusterPhase::Running);
            let ctx = Mocks::new(MockStatusStore::new()).context();
            let resync = ctx.config.running_resync;

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::requeue(resync));
        }
    }

    // =========================================================================
    // Deletion Stories
    // =========================================================================

    mod deletion {
        use super::*;

        /// Story: delete protection blocks deletion with a policy error
        #[tokio::test]
        async fn story_forbid_delete_blocks_deletion() {
            let mut cluster = cluster_in(ClusterPhase::Running);
            cluster.spec.forbid_delete = true;
            request_deletion(&mut cluster);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            let mut sink = MockStatusSink::new();
            sink.expect_on_phase_change().returning(|_, _, _, _| ());
            sink.expect_on_reconcile_error()
                .withf(|name, err| name == "prod" && err.kind() == "policy")
                .times(1)
                .returning(|_, _| ());
            mocks.sink = sink;
            let ctx = mocks.context();
            let resync = ctx.config.running_resync;

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();

            assert_eq!(action, Action::requeue(resync));
            assert_eq!(capture.phases(), vec![ClusterPhase::Running]);
            let last = capture.last().unwrap();
            assert!(last
                .conditions
                .iter()
                .any(|c| c.type_ == CONDITION_DELETION_BLOCKED));
        }

        /// Story: a blocked delete does not stop the health check in provisioned
        #[tokio::test]
        async fn story_blocked_delete_still_reaches_running() {
            let mut cluster = cluster_in(ClusterPhase::Provisioned);
            cluster.spec.forbid_delete = true;
            request_deletion(&mut cluster);
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks
                .health
                .expect_control_plane_healthy()
                .times(1)
                .returning(|_, _| Ok(true));
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();

            assert_eq!(
                capture.phases(),
                vec![ClusterPhase::Provisioned, ClusterPhase::Running]
            );
            let last = capture.last().unwrap();
            assert!(last
                .conditions
                .iter()
                .any(|c| c.type_ == CONDITION_DELETION_BLOCKED));
        }

        /// Story: teardown walks checkpoints newest first
        #[tokio::test]
        async fn story_teardown_in_reverse_order() {
            let mut cluster = cluster_in(ClusterPhase::Deleting);
            if let Some(status) = cluster.status.as_mut() {
                status.record_checkpoint(TaskKind::ReserveContainerNetwork, ResourceHandle::new("net-1"));
                status.record_checkpoint(TaskKind::CreateMasters, ResourceHandle::new("masters-1"));
                status.record_checkpoint(TaskKind::AttachApiserverLb, ResourceHandle::new("blb-1"));
            }
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            let order = Arc::new(Mutex::new(Vec::new()));
            let seen = order.clone();
            mocks.provisioner.expect_teardown().returning(move |_, handle| {
                seen.lock().unwrap().push(handle.id.clone());
                Ok(())
            });
            let ctx = mocks.context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();

            assert_eq!(*order.lock().unwrap(), vec!["blb-1", "masters-1", "net-1"]);
            let last = capture.last().unwrap();
            assert_eq!(last.phase, ClusterPhase::Deleted);
            assert!(last.live_checkpoints().is_empty());
        }

        #[tokio::test]
        async fn test_teardown_failure_moves_to_delete_failed() {
            let mut cluster = cluster_in(ClusterPhase::Deleting);
            if let Some(status) = cluster.status.as_mut() {
                status.record_checkpoint(TaskKind::CreateMasters, ResourceHandle::new("masters-1"));
            }
            let capture = StatusCapture::default();
            let mut mocks = Mocks::new(capturing_status_store(cluster.clone(), &capture));
            mocks.provisioner.expect_teardown().returning(|_, _| {
                Err(Error::provision_fatal("prod", "create-masters", "instance locked"))
            });
            let ctx = mocks.context();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
            assert_eq!(capture.last().unwrap().phase, ClusterPhase::DeleteFailed);
        }

        #[tokio::test]
        async fn test_deleted_record_is_removed() {
            let cluster = cluster_in(ClusterPhase::Deleted);
            let mut statuses = MockStatusStore::new();
            statuses
                .expect_remove_cluster()
                .times(1)
                .returning(|_| Ok(()));
            let ctx = Mocks::new(statuses).context();

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    // =========================================================================
    // Failed Phase Stories
    // =========================================================================

    mod failed_phases {
        use super::*;

        /// Story: failed terminals are stable without operator remediation
        #[tokio::test]
        async fn story_failed_phases_are_stable() {
            for phase in [ClusterPhase::CreateFailed, ClusterPhase::DeleteFailed] {
                let cluster = cluster_in(phase);
                // No status expectations: any write would panic
                let ctx = Mocks::new(MockStatusStore::new()).context();
                let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
                assert_eq!(action, Action::await_change(), "{phase}");
            }
        }

        /// Story: a retry request resumes a failed creation
        #[tokio::test]
        async fn story_operator_retry_resumes_provisioning() {
            let mut cluster = cluster_in(ClusterPhase::CreateFailed);
            cluster
                .annotations_mut()
                .insert(RETRY_ANNOTATION.to_string(), "1".to_string());
            let capture = StatusCapture::default();
            let ctx = Mocks::new(capturing_status_store(cluster.clone(), &capture)).context();

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            let last = capture.last().unwrap();
            assert_eq!(last.phase, ClusterPhase::Provisioning);
            assert_eq!(last.observed_retry, Some(1));
        }

        /// Story: a spec edit on a failed cluster is not a retry
        #[tokio::test]
        async fn story_spec_edit_does_not_resume_failed_phase() {
            for phase in [ClusterPhase::CreateFailed, ClusterPhase::DeleteFailed] {
                let mut cluster = cluster_in(phase);
                cluster.metadata.generation = Some(2);
                cluster.spec.description = "just a note".to_string();
                // No status expectations: any write would panic
                let ctx = Mocks::new(MockStatusStore::new()).context();
                let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
                assert_eq!(action, Action::await_change(), "{phase}");
            }
        }
    }

    // =========================================================================
    // Consistency and Error Policy
    // =========================================================================

    mod consistency {
        use super::*;

        /// Story: a phase written outside the reconciler is refused
        #[tokio::test]
        async fn story_external_phase_write_is_consistency_error() {
            let mut cluster = cluster_in(ClusterPhase::Provisioning);
            if let Some(status) = cluster.status.as_mut() {
                status.phase = ClusterPhase::Running;
            }
            let ctx = Mocks::new(MockStatusStore::new()).context();

            let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
            assert_eq!(err.kind(), "consistency");
        }

        #[tokio::test]
        async fn test_lost_compare_and_swap_is_consistency_error() {
            let cluster = sample_cluster("prod");
            let mut statuses = MockStatusStore::new();
            statuses.expect_patch_status().returning(|name, _, _| {
                Err(Error::consistency_in_phase(name, ClusterPhase::Pending, "revision moved"))
            });
            let ctx = Mocks::new(statuses).context();

            let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
            assert_eq!(err.kind(), "consistency");
        }

        #[test]
        fn test_error_policy_waits_on_human_errors() {
            let cluster = sample_cluster("prod");
            let ctx = Mocks::new(MockStatusStore::new()).context();
            for error in [
                Error::validation("prod", "clusterName", "required"),
                Error::policy("prod", "delete protection"),
                Error::consistency("prod", "phase mutated"),
            ] {
                assert_eq!(error_policy(&cluster, &error, &ctx), Action::await_change());
            }
        }

        #[test]
        fn test_error_policy_requeues_retryable_errors() {
            let cluster = sample_cluster("prod");
            let ctx = Mocks::new(MockStatusStore::new()).context();
            let error = Error::internal("store unavailable");
            assert_eq!(
                error_policy(&cluster, &error, &ctx),
                Action::requeue(ctx.config.error_requeue)
            );
        }

        #[tokio::test]
        async fn test_reconcile_key_ignores_missing_record() {
            let mut mocks = Mocks::new(MockStatusStore::new());
            mocks
                .specs
                .expect_get_cluster()
                .returning(|name| Err(Error::not_found(name)));
            let ctx = mocks.context();

            assert_eq!(reconcile_key("ghost", ctx).await, Action::await_change());
        }

        #[tokio::test]
        async fn test_reconcile_key_reports_errors_to_sink() {
            let mut cluster = cluster_in(ClusterPhase::Provisioning);
            if let Some(status) = cluster.status.as_mut() {
                status.phase = ClusterPhase::Running;
            }
            let mut mocks = Mocks::new(MockStatusStore::new());
            mocks
                .specs
                .expect_get_cluster()
                .returning(move |_| Ok(cluster.clone()));
            let mut sink = MockStatusSink::new();
            sink.expect_on_reconcile_error()
                .times(1)
                .returning(|_, _| ());
            mocks.sink = sink;
            let ctx = mocks.context();

            let action = reconcile_key("prod", ctx).await;
            assert_eq!(action, Action::await_change());
        }
    }
}
