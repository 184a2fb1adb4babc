//! IaaS provisioner and health probe seams
//!
//! The reconciler never talks to a cloud API directly. Every resource it
//! creates or destroys goes through [`IaasProvisioner`], and every call
//! carries an [`IdempotencyToken`] so that a call repeated after a crash or
//! a retry creates nothing new.

mod simulated;

pub use simulated::{Fault, SimulatedProvisioner};

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::crd::{
    AvailableZone, ClusterHa, ContainerNetworkMode, IpVersion, K8sVersion, MasterFlavor,
    MasterType, ResourceHandle, RuntimeType, TaskKind,
};
use crate::Error;

/// Token that makes a provisioner call idempotent
///
/// Derived from the cluster ID and the task name, so every attempt of the
/// same task for the same cluster presents the same token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Token for a task of a cluster
    pub fn new(cluster_id: &str, task: TaskKind) -> Self {
        Self(format!("{cluster_id}/{}", task.name()))
    }

    /// Token string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to reserve the container network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    /// Idempotency token
    pub token: IdempotencyToken,
    /// Cluster the network belongs to
    pub cluster_id: String,
    /// VPC to reserve routes or ENIs in
    pub vpc_id: String,
    /// Network mode
    pub mode: ContainerNetworkMode,
    /// IP family
    pub ip_version: IpVersion,
    /// What to reserve
    pub reservation: NetworkReservation,
}

/// Network resources a mode needs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NetworkReservation {
    /// Route entries for the kubenet pod CIDR
    PodCidrRoutes {
        /// IPv4 pod range
        pod_cidr: Option<String>,
        /// IPv6 pod range
        pod_cidr_ipv6: Option<String>,
    },
    /// VPC route table entries for vpc-route modes
    VpcRouteEntries {
        /// IPv4 pod range
        pod_cidr: Option<String>,
        /// IPv6 pod range
        pod_cidr_ipv6: Option<String>,
        /// Per-node CIDR sized for this many pods
        max_pods_per_node: u32,
    },
    /// ENI subnets and security group for vpc-cni and secondary IP modes
    EniSubnets {
        /// Subnets per zone
        subnets: Vec<(AvailableZone, String)>,
        /// Security group attached to the ENIs
        security_group_id: String,
    },
}

/// Request to create master replicas
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRequest {
    /// Idempotency token
    pub token: IdempotencyToken,
    /// Cluster the masters belong to
    pub cluster_id: String,
    /// Where the masters come from
    pub master_type: MasterType,
    /// Replica count
    pub ha: ClusterHa,
    /// Managed control plane size; managed masters only
    pub flavor: Option<MasterFlavor>,
    /// Master subnet zone; managed masters only
    pub subnet_zone: Option<AvailableZone>,
    /// Master subnet; managed masters only
    pub subnet_id: Option<String>,
    /// Master security group; managed masters only
    pub security_group_id: Option<String>,
    /// Kubernetes version to install
    pub k8s_version: K8sVersion,
    /// Container runtime to install
    pub runtime: RuntimeType,
    /// Container runtime version
    pub runtime_version: String,
}

/// Request to create the API server load balancer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRequest {
    /// Idempotency token
    pub token: IdempotencyToken,
    /// Cluster the load balancer fronts
    pub cluster_id: String,
    /// BLB subnet; empty lets the provider pick one in the VPC
    pub subnet_id: String,
    /// Bind a public EIP
    pub exposed_public: bool,
}

/// Creates and destroys the IaaS resources of a cluster
///
/// Every method must be idempotent under its token: a repeated call with a
/// token that already produced a resource returns that resource's handle.
/// Errors are [`Error::Provision`] values whose `retryable` flag says
/// whether a repeated call may succeed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IaasProvisioner: Send + Sync {
    /// Reserve pod routes, route entries or ENI subnets
    async fn create_network(&self, request: &NetworkRequest) -> Result<ResourceHandle, Error>;

    /// Create master replicas
    async fn create_master(&self, request: &MasterRequest) -> Result<ResourceHandle, Error>;

    /// Create the API server load balancer
    async fn create_load_balancer(
        &self,
        request: &LoadBalancerRequest,
    ) -> Result<ResourceHandle, Error>;

    /// Destroy a resource; destroying a resource that is already gone succeeds
    async fn teardown(
        &self,
        token: &IdempotencyToken,
        handle: &ResourceHandle,
    ) -> Result<(), Error>;
}

/// Checks whether a cluster's control plane answers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the API server behind `endpoint` is healthy
    async fn control_plane_healthy(
        &self,
        cluster_id: &str,
        endpoint: Option<String>,
    ) -> Result<bool, Error>;
}
