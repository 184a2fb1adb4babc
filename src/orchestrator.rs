//! Provisioning task orchestration
//!
//! Turns a cluster spec into an ordered list of provisioning tasks and runs
//! them against the IaaS provisioner. The orchestrator itself is stateless:
//! progress lives in the checkpoints of the cluster status, which the phase
//! handlers persist after every completed task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::crd::{
    ClusterSpec, ClusterStatus, ContainerNetworkMode, MasterType, ResourceHandle, TaskCheckpoint,
    TaskKind,
};
use crate::metrics;
use crate::provisioner::{
    IaasProvisioner, IdempotencyToken, LoadBalancerRequest, MasterRequest, NetworkRequest,
    NetworkReservation,
};
use crate::retry::{retry_with_backoff_notify, RetryConfig};
use crate::Error;

/// Request payload of a task
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "camelCase")]
pub enum TaskRequest {
    /// `create_network`
    Network(NetworkRequest),
    /// `create_master`
    Masters(MasterRequest),
    /// `create_load_balancer`
    LoadBalancer(LoadBalancerRequest),
}

/// One step of a provisioning plan
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProvisionTask {
    /// Which step this is
    pub kind: TaskKind,
    /// What to send to the provisioner
    pub request: TaskRequest,
}

impl ProvisionTask {
    /// Idempotency token carried by the request
    pub fn token(&self) -> &IdempotencyToken {
        match &self.request {
            TaskRequest::Network(r) => &r.token,
            TaskRequest::Masters(r) => &r.token,
            TaskRequest::LoadBalancer(r) => &r.token,
        }
    }
}

/// Result of a single task attempt
#[derive(Debug)]
pub enum TaskOutcome {
    /// The resource exists
    Completed(ResourceHandle),
    /// The call failed but may succeed if repeated
    RetryableError(Error),
    /// The call failed and repeating it will not help
    FatalError(Error),
}

impl From<Result<ResourceHandle, Error>> for TaskOutcome {
    fn from(result: Result<ResourceHandle, Error>) -> Self {
        match result {
            Ok(handle) => Self::Completed(handle),
            Err(e) if e.is_retryable() => Self::RetryableError(e),
            Err(e) => Self::FatalError(e),
        }
    }
}

/// Derive the ordered provisioning plan of a cluster
///
/// The network comes first so masters can be placed on it, and the API
/// server load balancer last since it fronts the masters.
pub fn plan(cluster_id: &str, spec: &ClusterSpec) -> Vec<ProvisionTask> {
    vec![
        network_task(cluster_id, spec),
        masters_task(cluster_id, spec),
        load_balancer_task(cluster_id, spec),
    ]
}

fn network_task(cluster_id: &str, spec: &ClusterSpec) -> ProvisionTask {
    let network = &spec.container_network_config;
    let mode = network.mode();
    let ip_version = network.ip_version();
    let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());

    let reservation = match mode {
        ContainerNetworkMode::Kubenet => NetworkReservation::PodCidrRoutes {
            pod_cidr: non_empty(&network.cluster_pod_cidr),
            pod_cidr_ipv6: non_empty(&network.cluster_pod_cidr_ipv6),
        },
        ContainerNetworkMode::VpcRouteVeth
        | ContainerNetworkMode::VpcRouteIpvlan
        | ContainerNetworkMode::VpcRouteAutoDetect => NetworkReservation::VpcRouteEntries {
            pod_cidr: non_empty(&network.cluster_pod_cidr),
            pod_cidr_ipv6: non_empty(&network.cluster_pod_cidr_ipv6),
            max_pods_per_node: network.max_pods_per_node(),
        },
        ContainerNetworkMode::VpcCni
        | ContainerNetworkMode::VpcSecondaryIpVeth
        | ContainerNetworkMode::VpcSecondaryIpIpvlan
        | ContainerNetworkMode::VpcSecondaryIpAutoDetect => NetworkReservation::EniSubnets {
            subnets: network
                .eni_vpc_subnet_ids
                .iter()
                .flat_map(|(zone, ids)| ids.iter().map(move |id| (*zone, id.clone())))
                .collect(),
            security_group_id: network.eni_security_group_id.clone(),
        },
    };

    ProvisionTask {
        kind: TaskKind::ReserveContainerNetwork,
        request: TaskRequest::Network(NetworkRequest {
            token: IdempotencyToken::new(cluster_id, TaskKind::ReserveContainerNetwork),
            cluster_id: cluster_id.to_string(),
            vpc_id: spec.vpc_id.clone(),
            mode,
            ip_version,
            reservation,
        }),
    }
}

fn masters_task(cluster_id: &str, spec: &ClusterSpec) -> ProvisionTask {
    let master = &spec.master_config;
    let master_type = master.master_type();
    let managed = match master_type {
        MasterType::Managed => master.managed_cluster_master_option.clone().unwrap_or_default(),
        MasterType::Custom | MasterType::Serverless => Default::default(),
    };
    let non_empty = |s: String| Some(s).filter(|s| !s.is_empty());
    let runtime = spec.runtime_type();
    let runtime_version = if spec.runtime_version.is_empty() {
        runtime.default_version().to_string()
    } else {
        spec.runtime_version.clone()
    };

    ProvisionTask {
        kind: TaskKind::CreateMasters,
        request: TaskRequest::Masters(MasterRequest {
            token: IdempotencyToken::new(cluster_id, TaskKind::CreateMasters),
            cluster_id: cluster_id.to_string(),
            master_type,
            ha: master.cluster_ha(),
            flavor: match master_type {
                MasterType::Managed => Some(managed.master_flavor.unwrap_or_default()),
                MasterType::Custom | MasterType::Serverless => None,
            },
            subnet_zone: managed.master_vpc_subnet_zone,
            subnet_id: non_empty(managed.master_vpc_subnet_uuid),
            security_group_id: non_empty(managed.master_security_group_uuid),
            k8s_version: spec.k8s_version(),
            runtime,
            runtime_version,
        }),
    }
}

fn load_balancer_task(cluster_id: &str, spec: &ClusterSpec) -> ProvisionTask {
    ProvisionTask {
        kind: TaskKind::AttachApiserverLb,
        request: TaskRequest::LoadBalancer(LoadBalancerRequest {
            token: IdempotencyToken::new(cluster_id, TaskKind::AttachApiserverLb),
            cluster_id: cluster_id.to_string(),
            subnet_id: spec.master_config.cluster_blb_vpc_subnet_id.clone(),
            exposed_public: spec.master_config.exposed_public,
        }),
    }
}

/// Tasks of `plan` that have no checkpoint yet, in plan order
pub fn remaining(plan: Vec<ProvisionTask>, status: Option<&ClusterStatus>) -> Vec<ProvisionTask> {
    plan.into_iter()
        .filter(|task| status.and_then(|s| s.checkpoint(task.kind)).is_none())
        .collect()
}

/// Runs provisioning tasks with retry, timeouts and a deadline
#[derive(Clone)]
pub struct Orchestrator {
    provisioner: Arc<dyn IaasProvisioner>,
    provision_retry: RetryConfig,
    teardown_retry: RetryConfig,
    attempt_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator over a provisioner
    pub fn new(
        provisioner: Arc<dyn IaasProvisioner>,
        provision_retry: RetryConfig,
        teardown_retry: RetryConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            provision_retry,
            teardown_retry,
            attempt_timeout,
        }
    }

    /// Make a single attempt of a task
    pub async fn execute(&self, task: &ProvisionTask) -> TaskOutcome {
        let cluster_id = match &task.request {
            TaskRequest::Network(r) => r.cluster_id.as_str(),
            TaskRequest::Masters(r) => r.cluster_id.as_str(),
            TaskRequest::LoadBalancer(r) => r.cluster_id.as_str(),
        };
        let call = async {
            match &task.request {
                TaskRequest::Network(r) => self.provisioner.create_network(r).await,
                TaskRequest::Masters(r) => self.provisioner.create_master(r).await,
                TaskRequest::LoadBalancer(r) => self.provisioner.create_load_balancer(r).await,
            }
        };
        let result = match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::provision_retryable(
                cluster_id,
                task.kind.name(),
                format!("attempt timed out after {:?}", self.attempt_timeout),
            )),
        };
        let outcome = TaskOutcome::from(result);
        metrics::record_task_attempt(task.kind, &outcome);
        outcome
    }

    /// Run a task until it completes, fails fatally or exhausts its budget
    ///
    /// `budget` caps the retry deadline with whatever remains of the
    /// transition deadline. `on_retry(attempt, error)` is called before each
    /// backoff sleep.
    pub async fn run_task(
        &self,
        task: &ProvisionTask,
        budget: Option<Duration>,
        mut on_retry: impl FnMut(u32, &Error),
    ) -> Result<ResourceHandle, Error> {
        let mut retry = self.provision_retry.clone();
        retry.deadline = min_deadline(retry.deadline, budget);

        debug!(task = %task.kind, token = %task.token(), "running provisioning task");
        let this = self;
        let handle = retry_with_backoff_notify(
            &retry,
            task.kind.name(),
            |attempt, e, _| on_retry(attempt, e),
            move || async move {
                match this.execute(task).await {
                    TaskOutcome::Completed(handle) => Ok(handle),
                    TaskOutcome::RetryableError(e) | TaskOutcome::FatalError(e) => Err(e),
                }
            },
        )
        .await?;
        info!(task = %task.kind, id = %handle.id, "provisioning task completed");
        Ok(handle)
    }

    /// Tear down the resource behind a checkpoint, with retry
    pub async fn teardown(
        &self,
        cluster_id: &str,
        checkpoint: &TaskCheckpoint,
        budget: Option<Duration>,
    ) -> Result<(), Error> {
        let mut retry = self.teardown_retry.clone();
        retry.deadline = min_deadline(retry.deadline, budget);
        let token = IdempotencyToken::new(cluster_id, checkpoint.task);
        let token = &token;
        let operation = format!("teardown-{}", checkpoint.task);
        let this = self;

        retry_with_backoff_notify(
            &retry,
            &operation,
            |_, _, _| {},
            move || async move {
                match tokio::time::timeout(
                    this.attempt_timeout,
                    this.provisioner.teardown(token, &checkpoint.handle),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::provision_retryable(
                        cluster_id,
                        checkpoint.task.name(),
                        format!("teardown timed out after {:?}", this.attempt_timeout),
                    )),
                }
            },
        )
        .await?;
        info!(task = %checkpoint.task, id = %checkpoint.handle.id, "resource torn down");
        Ok(())
    }
}

fn min_deadline(configured: Option<Duration>, budget: Option<Duration>) -> Option<Duration> {
    match (configured, budget) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
