//! Shared harness for lifecycle tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use cce_controller::config::ControllerConfig;
use cce_controller::controller::{transitions, Context, Scheduler};
use cce_controller::crd::{
    Cluster, ClusterHa, ClusterPhase, ClusterSpec, ClusterType, ContainerNetworkConfig,
    ContainerNetworkMode, MasterConfig, MasterType,
};
use cce_controller::provisioner::SimulatedProvisioner;
use cce_controller::service::ClusterService;
use cce_controller::status::{ChannelSink, PhaseChange};
use cce_controller::store::{MemoryStore, SpecStore};
use cce_controller::Error;

/// How long a test waits for a cluster to settle
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Fixtures
// =============================================================================

/// Managed, three masters, kubenet with a 10.0.0.0/16 pod range
pub fn managed_ha3_kubenet() -> ClusterSpec {
    ClusterSpec {
        cluster_name: "lifecycle".to_string(),
        cluster_type: Some(ClusterType::Normal),
        vpc_id: "vpc-lifecycle".to_string(),
        vpc_cidr: "192.168.0.0/16".to_string(),
        master_config: MasterConfig {
            master_type: Some(MasterType::Managed),
            cluster_ha: Some(ClusterHa::Medium),
            ..Default::default()
        },
        container_network_config: ContainerNetworkConfig {
            mode: Some(ContainerNetworkMode::Kubenet),
            lb_service_vpc_subnet_id: "sbn-lb".to_string(),
            cluster_pod_cidr: "10.0.0.0/16".to_string(),
            cluster_ip_service_cidr: "172.16.0.0/16".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A running controller wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<SimulatedProvisioner>,
    pub sink: Arc<ChannelSink>,
    pub ctx: Arc<Context>,
    pub scheduler: Scheduler,
    pub service: ClusterService,
    changes: broadcast::Receiver<PhaseChange>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provisioner(SimulatedProvisioner::new())
    }

    pub fn with_provisioner(provisioner: SimulatedProvisioner) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(provisioner);
        let sink = Arc::new(ChannelSink::new(1024));
        let changes = sink.subscribe();

        let ctx = Arc::new(
            Context::builder(
                store.clone(),
                store.clone(),
                provisioner.clone(),
                provisioner.clone(),
            )
            .config(ControllerConfig::fast())
            .sink(sink.clone())
            .build(),
        );
        let scheduler = Scheduler::new(ctx.clone());
        let service =
            ClusterService::new(store.clone(), store.clone()).with_scheduler(scheduler.clone());

        Self {
            store,
            provisioner,
            sink,
            ctx,
            scheduler,
            service,
            changes,
        }
    }

    /// Poll the store until `name` reaches `phase`
    pub async fn wait_for_phase(&self, name: &str, phase: ClusterPhase) -> Cluster {
        let wait = async {
            loop {
                if let Ok(cluster) = self.store.get_cluster(name).await {
                    if cluster.phase() == phase {
                        return cluster;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        match tokio::time::timeout(SETTLE_TIMEOUT, wait).await {
            Ok(cluster) => cluster,
            Err(_) => {
                let current = self.store.get_cluster(name).await.map(|c| c.phase());
                panic!("{name} never reached {phase}, currently {current:?}");
            }
        }
    }

    /// Poll the store until the record of `name` is gone
    pub async fn wait_for_removal(&self, name: &str) {
        let wait = async {
            while !matches!(
                self.store.get_cluster(name).await,
                Err(Error::NotFound { .. })
            ) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(SETTLE_TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("{name} was never removed"));
    }

    /// Phase transitions published so far for `name`, in order
    pub fn transitions_of(&mut self, name: &str) -> Vec<(ClusterPhase, ClusterPhase)> {
        let mut seen = Vec::new();
        while let Ok(change) = self.changes.try_recv() {
            if change.cluster == name && change.old_phase != change.new_phase {
                seen.push((change.old_phase, change.new_phase));
            }
        }
        seen
    }
}

/// Every transition must be an edge of the transition table
pub fn assert_table_edges(transitions: &[(ClusterPhase, ClusterPhase)]) {
    for (from, to) in transitions {
        assert!(
            transitions::is_allowed(*from, *to),
            "{from} -> {to} is not in the transition table"
        );
    }
    for pair in transitions.windows(2) {
        assert_eq!(pair[0].1, pair[1].0, "transitions are not contiguous: {pair:?}");
    }
}
